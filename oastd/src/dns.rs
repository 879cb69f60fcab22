use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, MX, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable as _, BinEncodable as _};
use oastd_task::{ShutdownSignal, Task};
use tokio::net::UdpSocket;

use crate::conf::DnsReceiverConf;
use crate::event::Event;
use crate::storage::Storage;

/// TTL for every synthesised resource record.
const RECORD_TTL: u32 = 300;

/// Large enough for any query we care about; EDNS0 extensions are a
/// non-goal, so oversized datagrams are simply cut off and fail to parse.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Query types recorded on events. Anything else is stored without a type.
fn query_type_name(query_type: RecordType) -> &'static str {
    match query_type {
        RecordType::A => "A",
        RecordType::NS => "NS",
        RecordType::SOA => "SOA",
        RecordType::MX => "MX",
        RecordType::CNAME => "CNAME",
        RecordType::AAAA => "AAAA",
        RecordType::TXT => "TXT",
        _ => "",
    }
}

/// One UDP accept loop answering DNS queries for the configured zone.
pub struct DnsListener {
    socket: UdpSocket,
    handler: Arc<DnsHandler>,
}

impl DnsListener {
    pub async fn init_and_bind(addr: SocketAddr, handler: Arc<DnsHandler>) -> anyhow::Result<Self> {
        info!(%addr, "Initiating DNS listener…");

        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;

        info!(%addr, "DNS listener started successfully");

        Ok(Self { socket, handler })
    }

    #[instrument("dns", skip(self), fields(port = self.socket.local_addr().map(|addr| addr.port()).unwrap_or_default()))]
    async fn serve(self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, peer_addr) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("failed to receive UDP datagram")?;

            let query = match Message::from_bytes(&buf[..len]) {
                Ok(message) => message,
                Err(error) => {
                    debug!(%error, %peer_addr, "dropping malformed DNS message");
                    continue;
                }
            };

            let reply = self.handler.handle_query(&query, peer_addr);

            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(error) = self.socket.send_to(&bytes, peer_addr).await {
                        warn!(%error, %peer_addr, "failed to send DNS reply");
                    }
                }
                Err(error) => warn!(%error, "failed to encode DNS reply"),
            }
        }
    }
}

#[async_trait]
impl Task for DnsListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "dns listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

/// Answers queries for the configured zone and records the ones that carry a
/// known test ID.
pub struct DnsHandler {
    /// Lowercased zone apex with trailing dot; authority is decided by
    /// suffix match against it.
    domain_fqdn: String,
    ns1: Name,
    ns2: Name,
    mail: Name,
    public_ip: std::net::Ipv4Addr,
    txt: Vec<String>,
    storage: Arc<Storage>,
}

impl DnsHandler {
    pub fn new(conf: &DnsReceiverConf, storage: Arc<Storage>) -> anyhow::Result<Self> {
        let domain_fqdn = to_fqdn(&conf.domain);

        let ns1 = Name::from_ascii(format!("ns1.{domain_fqdn}")).context("invalid DNS domain")?;
        let ns2 = Name::from_ascii(format!("ns2.{domain_fqdn}")).context("invalid DNS domain")?;
        let mail = Name::from_ascii(format!("mail.{domain_fqdn}")).context("invalid DNS domain")?;

        Ok(Self {
            domain_fqdn,
            ns1,
            ns2,
            mail,
            public_ip: conf.public_ip,
            txt: conf.txt.clone(),
            storage,
        })
    }

    pub fn handle_query(&self, query: &Message, peer_addr: SocketAddr) -> Message {
        info!("DNS event received");

        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(query.op_code());
        reply.set_recursion_desired(query.recursion_desired());

        let Some(question) = query.queries().first() else {
            debug!(%peer_addr, "DNS query without question section");
            return reply;
        };
        reply.add_query(question.clone());

        let qname = question.name().to_string().to_ascii_lowercase();
        let query_type = question.query_type();

        if let Some((id, _)) = self.storage.search_test(|id, _| qname.contains(id)) {
            match Event::new_dns(
                id,
                peer_addr.to_string(),
                dump_query(query),
                query_type_name(query_type),
            ) {
                Ok(event) => {
                    if let Err(error) = self.storage.store_event(event) {
                        info!("error storing a new DNS event");
                        debug!(%error, "store DNS event error");
                    } else {
                        info!("new DNS event stored");
                    }
                }
                Err(error) => {
                    info!("error creating a new DNS event");
                    debug!(error = format!("{error:#}"), "new DNS event error");
                }
            }
        } else {
            debug!(%qname, "DNS query matched no test");
        }

        self.set_answer(&mut reply, question.name(), &qname, query_type);

        reply
    }

    /// Synthesises the answer section when we are authoritative for the
    /// queried name; outside the zone the reply stays empty.
    fn set_answer(&self, reply: &mut Message, name: &Name, qname: &str, query_type: RecordType) {
        if !qname.ends_with(self.domain_fqdn.as_str()) {
            return;
        }

        reply.set_authoritative(true);

        if matches!(query_type, RecordType::A | RecordType::ANY) {
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::A(A(self.public_ip)),
            ));
        }

        if matches!(query_type, RecordType::NS | RecordType::ANY) {
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::NS(NS(self.ns1.clone())),
            ));
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::NS(NS(self.ns2.clone())),
            ));
        }

        if matches!(query_type, RecordType::SOA | RecordType::ANY) {
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::SOA(SOA::new(
                    self.ns1.clone(),
                    self.mail.clone(),
                    10_000,  // serial
                    604_800, // refresh
                    11_000,  // retry
                    120_000, // expire
                    10_000,  // minimum
                )),
            ));
        }

        if matches!(query_type, RecordType::MX | RecordType::ANY) {
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::MX(MX::new(1, self.mail.clone())),
            ));
        }

        if !self.txt.is_empty() && matches!(query_type, RecordType::TXT | RecordType::ANY) {
            reply.add_answer(Record::from_rdata(
                name.clone(),
                RECORD_TTL,
                RData::TXT(TXT::new(self.txt.clone())),
            ));
        }
    }
}

fn to_fqdn(domain: &str) -> String {
    let domain = domain.to_ascii_lowercase();
    if domain.ends_with('.') { domain } else { format!("{domain}.") }
}

/// Dig-style rendering of the incoming message for the event dump.
fn dump_query(query: &Message) -> String {
    use std::fmt::Write as _;

    let mut dump = format!(
        ";; opcode: {:?}, status: {:?}, id: {}\r\n",
        query.op_code(),
        query.response_code(),
        query.id(),
    );

    dump.push_str(";; QUESTION SECTION:\r\n");
    for question in query.queries() {
        let _ = write!(
            dump,
            ";{}\t{:?}\t{}\r\n",
            question.name(),
            question.query_class(),
            question.query_type(),
        );
    }

    dump
}
