use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// Header names carrying the client-facing host, most authoritative first.
const HOST_HEADERS: &[&str] = &[
    // RFC 7239
    "forwarded",
    // Popular but non-standard
    "x-forwarded-host",
];

/// Rejects any request whose effective host does not match the configured
/// API domain. Installed only when a domain is configured.
pub async fn host_guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(domain) = state.domain.as_deref() else {
        return next.run(request).await;
    };

    let host = effective_host(request.headers());

    if host.as_deref() != Some(domain) {
        debug!(?host, domain, "request rejected by host guard");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    next.run(request).await
}

/// The forwarded host when present, else the transport `Host`, stripped of
/// its port and lowercased.
fn effective_host(headers: &HeaderMap) -> Option<String> {
    let raw = HOST_HEADERS
        .iter()
        .find_map(|name| non_empty_header(headers, name))
        .or_else(|| non_empty_header(headers, header::HOST.as_str()))?;

    let host = raw.split(':').next().unwrap_or_default();
    Some(host.to_ascii_lowercase())
}

fn non_empty_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                axum::http::HeaderName::try_from(*name).expect("header name"),
                HeaderValue::from_str(value).expect("header value"),
            );
        }
        headers
    }

    #[test]
    fn host_header_is_stripped_of_port_and_lowercased() {
        let headers = headers(&[("host", "OAST.Example.COM:2096")]);
        assert_eq!(effective_host(&headers).as_deref(), Some("oast.example.com"));
    }

    #[test]
    fn forwarded_takes_precedence_over_x_forwarded_host_and_host() {
        let headers = headers(&[
            ("host", "internal.example.com"),
            ("x-forwarded-host", "proxy.example.com"),
            ("forwarded", "edge.example.com"),
        ]);
        assert_eq!(effective_host(&headers).as_deref(), Some("edge.example.com"));
    }

    #[test]
    fn empty_forwarding_headers_fall_back_to_host() {
        let headers = headers(&[("host", "oast.example.com"), ("x-forwarded-host", "")]);
        assert_eq!(effective_host(&headers).as_deref(), Some("oast.example.com"));
    }
}
