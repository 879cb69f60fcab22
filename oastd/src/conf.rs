use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::tls;

/// Runtime TLS material for one listener family.
#[derive(Clone)]
pub struct Tls {
    pub acceptor: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tls").finish_non_exhaustive()
    }
}

impl Tls {
    fn init(config: rustls::ServerConfig) -> Self {
        Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        }
    }
}

/// Validated runtime configuration.
///
/// This is what the rest of the code consumes: addresses are parsed, TLS
/// acceptors are built, durations and byte sizes are resolved. The JSON file
/// shape lives in [`dto`].
#[derive(Debug)]
pub struct Conf {
    pub api: ApiConf,
    pub http_receiver: HttpReceiverConf,
    pub dns_receiver: DnsReceiverConf,
    pub storage: StorageConf,
    pub log_file: Option<PathBuf>,
    pub log_directive: Option<String>,
}

#[derive(Debug)]
pub struct ApiConf {
    pub host: IpAddr,
    /// When set, a host guard rejects requests addressed to any other domain.
    pub domain: Option<String>,
    pub tls_port: u16,
    pub tls: Tls,
    /// Normalized (leading slash) status endpoint path, when enabled.
    pub status_path: Option<String>,
}

#[derive(Debug)]
pub struct HttpReceiverConf {
    pub host: IpAddr,
    pub ports: Vec<u16>,
    pub tls_ports: Vec<u16>,
    pub tls: Option<Tls>,
    pub real_ip_header: Option<String>,
}

#[derive(Debug)]
pub struct DnsReceiverConf {
    pub domain: String,
    pub host: IpAddr,
    pub ports: Vec<u16>,
    pub public_ip: Ipv4Addr,
    pub txt: Vec<String>,
}

#[derive(Debug)]
pub struct StorageConf {
    pub max_events: usize,
    pub max_events_by_test: usize,
    pub max_dump_size: usize,
    pub hmac_key: Vec<u8>,
    pub ttl: Duration,
    pub check_interval: Duration,
    pub max_restarts: u32,
}

pub fn get_conf_file_path() -> PathBuf {
    std::env::var_os("OASTD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("oastd.json"))
}

impl Conf {
    pub fn init() -> anyhow::Result<Self> {
        let path = get_conf_file_path();
        Self::load(&path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read configuration file at {}", path.display()))?;
        let conf_file: dto::ConfFile =
            serde_json::from_str(&contents).context("invalid configuration file")?;
        Self::from_conf_file(&conf_file)
    }

    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let api = {
            let certificates = tls::load_certificates(&conf_file.api.tls_certificate_file)
                .context("API TLS certificate")?;
            let private_key = tls::load_private_key(&conf_file.api.tls_private_key_file)
                .context("API TLS private key")?;
            let server_config = tls::build_api_server_config(certificates, private_key)
                .context("API TLS configuration")?;

            ApiConf {
                host: parse_host(conf_file.api.host.as_deref())?,
                domain: normalize_domain(conf_file.api.domain.as_deref()),
                tls_port: conf_file.api.tls_port,
                tls: Tls::init(server_config),
                status_path: normalize_status_path(
                    conf_file.api.status.as_ref().map(|status| status.url_path.as_str()),
                ),
            }
        };

        let http_receiver = {
            let tls = match &conf_file.http_receiver.tls {
                Some(receiver_tls) if !receiver_tls.ports.is_empty() => {
                    let certificates = tls::load_certificates(&receiver_tls.certificate_file)
                        .context("HTTP receiver TLS certificate")?;
                    let private_key = tls::load_private_key(&receiver_tls.private_key_file)
                        .context("HTTP receiver TLS private key")?;
                    let server_config =
                        tls::build_receiver_server_config(certificates, private_key)
                            .context("HTTP receiver TLS configuration")?;
                    Some(Tls::init(server_config))
                }
                _ => None,
            };

            HttpReceiverConf {
                host: parse_host(conf_file.http_receiver.host.as_deref())?,
                ports: conf_file.http_receiver.ports.clone(),
                tls_ports: conf_file
                    .http_receiver
                    .tls
                    .as_ref()
                    .map(|receiver_tls| receiver_tls.ports.clone())
                    .unwrap_or_default(),
                tls,
                real_ip_header: conf_file
                    .http_receiver
                    .real_ip_header
                    .clone()
                    .filter(|header| !header.is_empty()),
            }
        };

        let dns_receiver = DnsReceiverConf {
            domain: conf_file.dns_receiver.domain.clone(),
            host: parse_host(conf_file.dns_receiver.host.as_deref())?,
            ports: conf_file.dns_receiver.ports.clone(),
            public_ip: conf_file
                .dns_receiver
                .public_ip
                .parse()
                .context("DnsReceiver.PublicIp is not a valid IPv4 address")?,
            txt: conf_file.dns_receiver.txt.clone(),
        };

        let storage = StorageConf {
            max_events: conf_file.storage.max_events,
            max_events_by_test: conf_file.storage.max_events_by_test,
            max_dump_size: conf_file.storage.max_dump_size.as_usize(),
            hmac_key: conf_file.storage.hmac_key.clone().into_bytes(),
            ttl: conf_file.storage.expire.ttl.into(),
            check_interval: conf_file.storage.expire.check_interval.into(),
            max_restarts: conf_file.storage.expire.max_restarts,
        };

        Ok(Self {
            api,
            http_receiver,
            dns_receiver,
            storage,
            log_file: conf_file.log_file.clone(),
            log_directive: conf_file.log_directive.clone(),
        })
    }
}

fn parse_host(host: Option<&str>) -> anyhow::Result<IpAddr> {
    match host {
        None | Some("") => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        Some(host) => host
            .parse()
            .with_context(|| format!("host {host} is not an IP address")),
    }
}

fn normalize_domain(domain: Option<&str>) -> Option<String> {
    domain
        .filter(|domain| !domain.is_empty())
        .map(str::to_ascii_lowercase)
}

/// The status endpoint is only mounted for a non-empty path that isn't the
/// home page.
fn normalize_status_path(path: Option<&str>) -> Option<String> {
    let path = path?.trim();
    if path.is_empty() || path == "/" {
        return None;
    }
    if path.starts_with('/') {
        Some(path.to_owned())
    } else {
        Some(format!("/{path}"))
    }
}

pub mod dto {
    use std::path::PathBuf;
    use std::time::Duration;

    use serde::{Deserialize, Serialize, de};

    /// Source of truth for the server configuration.
    ///
    /// This struct represents the JSON file used for configuration as close
    /// as possible and is not trying to be too smart.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        pub api: ApiConf,
        pub http_receiver: HttpReceiverConf,
        pub dns_receiver: DnsReceiverConf,
        pub storage: StorageConf,

        /// Optional log file; stdout is always written to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub log_file: Option<PathBuf>,
        /// Additional log filtering directives (tracing EnvFilter syntax).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ApiConf {
        /// Bind address; all interfaces when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub host: Option<String>,
        /// Public domain of the API; enables the host guard.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub domain: Option<String>,
        pub tls_port: u16,
        pub tls_certificate_file: PathBuf,
        pub tls_private_key_file: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub status: Option<ApiStatusConf>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ApiStatusConf {
        pub url_path: String,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct HttpReceiverConf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub host: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub ports: Vec<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tls: Option<HttpReceiverTlsConf>,
        /// Header carrying the client IP when running behind a proxy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub real_ip_header: Option<String>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct HttpReceiverTlsConf {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub ports: Vec<u16>,
        pub certificate_file: PathBuf,
        pub private_key_file: PathBuf,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct DnsReceiverConf {
        pub domain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub host: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub ports: Vec<u16>,
        pub public_ip: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub txt: Vec<String>,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct StorageConf {
        pub max_events: usize,
        pub max_events_by_test: usize,
        pub max_dump_size: ByteSize,
        pub hmac_key: HmacKey,
        pub expire: ExpireConf,
    }

    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ExpireConf {
        pub ttl: ConfDuration,
        pub check_interval: ConfDuration,
        pub max_restarts: u32,
    }

    /// Size in bytes parsed from a suffixed string such as `"64KB"` or
    /// `"1MiB"`.
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct ByteSize(u64);

    impl ByteSize {
        pub fn as_usize(self) -> usize {
            usize::try_from(self.0).unwrap_or(usize::MAX)
        }
    }

    const BYTE_SIZE_UNITS: &[(&str, u64)] = &[
        ("B", 1),
        // IEC, 1024-based
        ("KIB", 1 << 10),
        ("MIB", 1 << 20),
        ("GIB", 1 << 30),
        ("TIB", 1 << 40),
        ("PIB", 1 << 50),
        // SI, 1000-based
        ("KB", 1_000),
        ("MB", 1_000_000),
        ("GB", 1_000_000_000),
        ("TB", 1_000_000_000_000),
        ("PB", 1_000_000_000_000_000),
        ("EB", 1_000_000_000_000_000_000),
    ];

    /// Parses `"80KB"`-style sizes. A bare number or an unknown suffix is an
    /// error; a fractional count is floored after scaling.
    pub fn parse_byte_size(value: &str) -> Result<u64, String> {
        let value = value.trim();

        let split_at = value
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| "wrong format".to_owned())?;
        let (number, suffix) = value.split_at(split_at);
        let number = number.trim();
        let suffix = suffix.trim();

        let unit = BYTE_SIZE_UNITS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(suffix))
            .map(|(_, unit)| *unit)
            .ok_or_else(|| format!("unrecognised size suffix {suffix}"))?;

        if number.contains('.') {
            let count: f64 = number.parse().map_err(|_| "wrong format".to_owned())?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let bytes = (count * unit as f64) as u64;
            Ok(bytes)
        } else {
            let count: u64 = number.parse().map_err(|_| "wrong format".to_owned())?;
            count
                .checked_mul(unit)
                .ok_or_else(|| "size overflows".to_owned())
        }
    }

    impl Serialize for ByteSize {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format!("{}B", self.0))
        }
    }

    impl<'de> Deserialize<'de> for ByteSize {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            parse_byte_size(&value).map(ByteSize).map_err(de::Error::custom)
        }
    }

    /// Duration parsed from a humantime string such as `"10s"` or `"500ms"`.
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct ConfDuration(Duration);

    impl From<ConfDuration> for Duration {
        fn from(duration: ConfDuration) -> Self {
            duration.0
        }
    }

    impl Serialize for ConfDuration {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&humantime::format_duration(self.0).to_string())
        }
    }

    impl<'de> Deserialize<'de> for ConfDuration {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            humantime::parse_duration(&value)
                .map(ConfDuration)
                .map_err(de::Error::custom)
        }
    }

    /// Raw MAC key, at most the 64 bytes BLAKE2b supports.
    #[derive(PartialEq, Eq, Debug, Clone)]
    pub struct HmacKey(Vec<u8>);

    impl HmacKey {
        pub fn into_bytes(self) -> Vec<u8> {
            self.0
        }
    }

    const MAX_KEY_SIZE: usize = 64;

    impl Serialize for HmacKey {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&String::from_utf8_lossy(&self.0))
        }
    }

    impl<'de> Deserialize<'de> for HmacKey {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            if value.len() > MAX_KEY_SIZE {
                return Err(de::Error::custom(format!(
                    "HmacKey must be between 0 and {MAX_KEY_SIZE} bytes long"
                )));
            }
            Ok(HmacKey(value.into_bytes()))
        }
    }

    #[cfg(test)]
    mod tests {
        use rstest::rstest;

        use super::*;

        #[rstest]
        #[case("1B", 1)]
        #[case("1KB", 1_000)]
        #[case("1KiB", 1_024)]
        #[case("1MiB", 1_048_576)]
        #[case("2MB", 2_000_000)]
        #[case("80.5555555KB", 80_555)]
        #[case(" 64 KB ", 64_000)]
        fn byte_size_parsing(#[case] input: &str, #[case] expected: u64) {
            assert_eq!(parse_byte_size(input), Ok(expected));
        }

        #[rstest]
        #[case("80")] // bare number, no unit
        #[case("80KBB")] // unknown suffix
        #[case("KB")] // no number
        #[case("")]
        #[case("12.3.4KB")]
        fn byte_size_rejects_malformed_input(#[case] input: &str) {
            assert!(parse_byte_size(input).is_err());
        }

        #[test]
        fn duration_parses_humantime_strings() {
            let parsed: ConfDuration =
                serde_json::from_str("\"500ms\"").expect("valid duration");
            assert_eq!(Duration::from(parsed), Duration::from_millis(500));

            let parsed: ConfDuration = serde_json::from_str("\"24h\"").expect("valid duration");
            assert_eq!(Duration::from(parsed), Duration::from_secs(24 * 3600));

            assert!(serde_json::from_str::<ConfDuration>("\"bogus\"").is_err());
        }

        #[test]
        fn hmac_key_is_capped_at_64_bytes() {
            let ok = format!("\"{}\"", "k".repeat(64));
            assert!(serde_json::from_str::<HmacKey>(&ok).is_ok());

            let too_long = format!("\"{}\"", "k".repeat(65));
            assert!(serde_json::from_str::<HmacKey>(&too_long).is_err());
        }

        #[test]
        fn conf_file_round_trips_from_json() {
            let json = serde_json::json!({
                "Api": {
                    "Host": "127.0.0.1",
                    "Domain": "oast.example.com",
                    "TlsPort": 2096,
                    "TlsCertificateFile": "/etc/oastd/tls/fullchain.pem",
                    "TlsPrivateKeyFile": "/etc/oastd/tls/key.pem",
                    "Status": { "UrlPath": "/status-7a918a" }
                },
                "HttpReceiver": {
                    "Ports": [80, 8080],
                    "Tls": {
                        "Ports": [443],
                        "CertificateFile": "/etc/oastd/tls/fullchain.pem",
                        "PrivateKeyFile": "/etc/oastd/tls/key.pem"
                    },
                    "RealIpHeader": "X-Real-IP"
                },
                "DnsReceiver": {
                    "Domain": "oast.example.com",
                    "Ports": [53],
                    "PublicIp": "203.0.113.77",
                    "Txt": ["v=spf1 -all"]
                },
                "Storage": {
                    "MaxEvents": 1000000,
                    "MaxEventsByTest": 100,
                    "MaxDumpSize": "64KB",
                    "HmacKey": "changeme",
                    "Expire": {
                        "Ttl": "24h",
                        "CheckInterval": "1m",
                        "MaxRestarts": 5
                    }
                }
            });

            let conf_file: ConfFile =
                serde_json::from_value(json).expect("well-formed configuration");

            assert_eq!(conf_file.api.tls_port, 2096);
            assert_eq!(conf_file.http_receiver.ports, vec![80, 8080]);
            assert_eq!(conf_file.storage.max_dump_size.as_usize(), 64_000);
            assert_eq!(
                Duration::from(conf_file.storage.expire.check_interval),
                Duration::from_secs(60)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_path_normalization() {
        assert_eq!(normalize_status_path(None), None);
        assert_eq!(normalize_status_path(Some("")), None);
        assert_eq!(normalize_status_path(Some("/")), None);
        assert_eq!(
            normalize_status_path(Some("status-7a918a")),
            Some("/status-7a918a".to_owned())
        );
        assert_eq!(
            normalize_status_path(Some("/status-7a918a")),
            Some("/status-7a918a".to_owned())
        );
    }

    #[test]
    fn hosts_default_to_all_interfaces() {
        assert_eq!(
            parse_host(None).expect("default host"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(
            parse_host(Some("")).expect("empty host"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert!(parse_host(Some("not an ip")).is_err());
    }

    #[test]
    fn domains_are_lowercased() {
        assert_eq!(
            normalize_domain(Some("OAST.Example.COM")),
            Some("oast.example.com".to_owned())
        );
        assert_eq!(normalize_domain(Some("")), None);
    }
}
