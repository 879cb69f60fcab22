use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{Html, IntoResponse, Response};

use crate::api::PROJECT_URL;
use crate::event::{Event, Receiver};
use crate::storage::Storage;

/// State shared by every catch-all listener of one flavor (plain or TLS).
#[derive(Clone)]
pub struct CatchAllState {
    pub storage: Arc<Storage>,
    /// Header carrying the client IP when running behind a proxy.
    pub real_ip_header: Option<String>,
    /// Whether the connections feeding this router went through the TLS
    /// acceptor; decides between the `HTTP` and `HTTPS` receiver tags.
    pub tls: bool,
}

/// Routes every method and path to the catch-all handler.
pub fn make_router(state: CatchAllState) -> axum::Router {
    axum::Router::new().fallback(catch_all).with_state(state)
}

/// Records an event for any request containing a known test ID and answers
/// with the test's canary; everything else gets the home page.
async fn catch_all(
    State(state): State<CatchAllState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    info!("HTTP event received");

    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            info!("could not dump HTTP request event");
            debug!(%error, "request dump error");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let dump = dump_request(&parts, &body);

    // Does the request contain any known test ID, anywhere?
    let Some((id, canary)) = state.storage.search_test(|id, _| dump.contains(id)) else {
        debug!("HTTP event matched no test");
        return Html(format!(
            "<html><body>oastd (<a href=\"{PROJECT_URL}\">learn more</a>)</body></html>"
        ))
        .into_response();
    };

    let receiver = if state.tls { Receiver::Https } else { Receiver::Http };

    let remote_addr = state
        .real_ip_header
        .as_deref()
        .and_then(|header| parts.headers.get(header))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| peer_addr.to_string(), str::to_owned);

    match Event::new(id, receiver, remote_addr, dump) {
        Ok(event) => {
            if let Err(error) = state.storage.store_event(event) {
                info!("error storing a new HTTP event");
                debug!(%error, "store HTTP event error");
            } else {
                info!("new HTTP event stored");
            }
        }
        Err(error) => {
            info!("error creating a new HTTP event");
            debug!(error = format!("{error:#}"), "new HTTP event error");
        }
    }

    Html(format!("<html><body>{canary}</body></html>")).into_response()
}

/// Textual request dump: request line, headers, blank line, body. Bounded
/// upstream only by the store's dump truncation.
fn dump_request(parts: &Parts, body: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut dump = format!("{} {} {:?}\r\n", parts.method, parts.uri, parts.version);

    for (name, value) in &parts.headers {
        let _ = write!(dump, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }

    dump.push_str("\r\n");
    dump.push_str(&String::from_utf8_lossy(body));
    dump
}
