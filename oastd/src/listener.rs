use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use futures::TryFutureExt as _;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use oastd_task::{ChildTask, ShutdownSignal, Task};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower_http::timeout::TimeoutLayer;
use tracing::Instrument as _;

/// Per-connection header read budget.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-request response budget, enforced by the timeout layer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Whole-connection ceiling; also bounds keep-alive idling.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// One HTTP(S) accept loop bound to a socket, serving an axum router.
///
/// Both the catch-all receivers and the events API run through this; the
/// only difference is the router and whether a TLS acceptor is involved.
pub struct HttpListener {
    addr: SocketAddr,
    listener: TcpListener,
    router: axum::Router,
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpListener {
    pub fn init_and_bind(
        addr: SocketAddr,
        router: axum::Router,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> anyhow::Result<Self> {
        info!(%addr, "Initiating listener…");

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        info!(%addr, tls = tls_acceptor.is_some(), "Listener started successfully");

        Ok(Self {
            addr,
            listener,
            router,
            tls_acceptor,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    async fn serve(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let router = self.router.clone();
                    let tls_acceptor = self.tls_acceptor.clone();

                    let fut = tokio::time::timeout(IDLE_TIMEOUT, async move {
                        let result = match tls_acceptor {
                            Some(tls_acceptor) => {
                                handle_https_peer(stream, tls_acceptor, router, peer_addr).await
                            }
                            None => handle_http_peer(stream, router, peer_addr).await,
                        };

                        if let Err(error) = result {
                            error!(error = format!("{error:#}"), "Peer failure");
                        }
                    })
                    .map_err(|error| warn!(%error, "connection timed out"))
                    .instrument(info_span!("peer", client = %peer_addr));

                    ChildTask::spawn(fut).detach();
                }
                Err(error) => {
                    error!(%error, "failed to accept connection");
                }
            }
        }
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.serve() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn handle_https_peer(
    stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    router: axum::Router,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let tls_stream = tls_acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;

    serve_connection(tls_stream, router, peer_addr).await
}

async fn handle_http_peer(
    stream: TcpStream,
    router: axum::Router,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    serve_connection(stream, router, peer_addr).await
}

async fn serve_connection<I>(io: I, router: axum::Router, peer_addr: SocketAddr) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let app = router
        .layer(TimeoutLayer::new(WRITE_TIMEOUT))
        .layer(axum::Extension(ConnectInfo(peer_addr)));

    hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_TIMEOUT)
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(app))
        .await
        .context("HTTP connection")
}
