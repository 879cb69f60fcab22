pub mod events;
pub mod status;

use axum::response::Html;

use crate::AppState;

pub const PROJECT_URL: &str = "https://github.com/oastd/oastd";

/// Assembles the events API router: home page, `/events` behind the
/// authorization middleware, and the status endpoint when configured.
pub fn make_router(state: AppState) -> axum::Router {
    let mut router = axum::Router::new()
        .route("/", axum::routing::get(home))
        .route(
            "/events",
            axum::routing::get(events::get_events).route_layer(
                axum::middleware::from_fn_with_state(
                    state.clone(),
                    crate::middleware::auth::auth_middleware,
                ),
            ),
        );

    if let Some(status_path) = state.status_path.as_deref() {
        router = router.route(status_path, axum::routing::get(status::get_status));
    }

    if state.domain.is_some() {
        router = router.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::host::host_guard_middleware,
        ));
    }

    router = router.layer(axum::middleware::from_fn(
        crate::middleware::log::log_middleware,
    ));

    router.with_state(state)
}

async fn home() -> Html<String> {
    Html(format!(
        "<html><body>oastd API (<a href=\"{PROJECT_URL}\">learn more</a>)</body></html>"
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::prelude::{BASE64_STANDARD, Engine as _};
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use super::*;
    use crate::storage::{Storage, StorageConfig};

    const SECRET_B64: &str = "872k5eD/lGRbMZ3GqIPB0bUzqRjBlt1lhLH4+/42sKa=";
    const EXPECTED_ID: &str = "mpqhomfbxab55m5de32mywvfoy";
    const EXPECTED_CANARY: &str = "k2b27meg7dfifvxuxmnfnm24oa";

    fn test_state(domain: Option<&str>) -> AppState {
        let storage = Storage::new(
            StorageConfig {
                ttl: Duration::from_secs(300),
                check_interval: Duration::from_millis(10),
                max_restarts: 2,
                max_events: 1000,
                max_events_by_test: 10,
                max_dump_size: 64 * 1024,
            },
            b"testing",
        )
        .expect("storage");

        AppState {
            storage: Arc::new(storage),
            domain: domain.map(str::to_owned),
            status_path: Some("/status-7a918a".to_owned()),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn events_request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/events");
        if let Some(authorization) = authorization {
            builder = builder.header("Authorization", authorization);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn events_happy_path_returns_identity_and_empty_list() {
        let router = make_router(test_state(None));

        let response = router
            .oneshot(events_request(Some(&format!("Secret {SECRET_B64}"))))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["id"], EXPECTED_ID);
        assert_eq!(value["canary"], EXPECTED_CANARY);
        assert_eq!(value["events"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn events_returns_stored_interactions() {
        let state = test_state(None);
        let (id, _) = state.storage.set_test(b"another secret").expect("set test");
        let event = crate::event::Event::new(
            id,
            crate::event::Receiver::Http,
            "198.51.100.7:43210",
            "GET / HTTP/1.1",
        )
        .expect("event");
        state.storage.store_event(event).expect("store");

        let router = make_router(state);
        let authorization = format!("Secret {}", BASE64_STANDARD.encode(b"another secret"));
        let response = router
            .oneshot(events_request(Some(&authorization)))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        let events = value["events"].as_array().expect("events array");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["receiver"], "HTTP");
        assert_eq!(events[0]["remoteAddress"], "198.51.100.7:43210");
    }

    #[rstest::rstest]
    // Header absent.
    #[case(None)]
    // No space between type and secret.
    #[case(Some("Secret872k5eD/lGRbMZ3GqIPB0bUzqRjBlt1lhLH4+/42sKa="))]
    // Wrong type token.
    #[case(Some("Secrt 872k5eD/lGRbMZ3GqIPB0bUzqRjBlt1lhLH4+/42sKa="))]
    // Decodes to 45 bytes, one over the limit.
    #[case(Some("Secret AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"))]
    // Invalid base64.
    #[case(Some("Secret ????"))]
    // Too many tokens.
    #[case(Some("Secret 872k5eD/ extra"))]
    #[tokio::test]
    async fn events_rejects_bad_authorization(#[case] authorization: Option<&str>) {
        let router = make_router(test_state(None));

        let response = router
            .oneshot(events_request(authorization))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = body_json(response).await;
        assert_eq!(value["status"], "Unauthorized");
        assert!(value["error"].is_string());
    }

    #[tokio::test]
    async fn events_surfaces_capacity_exhaustion_as_unauthorized() {
        let state = test_state(None);
        // A single test fits; fill the store.
        let storage = Storage::new(
            StorageConfig {
                ttl: Duration::from_secs(300),
                check_interval: Duration::from_millis(10),
                max_restarts: 2,
                max_events: 10,
                max_events_by_test: 10,
                max_dump_size: 64 * 1024,
            },
            b"testing",
        )
        .expect("storage");
        storage.set_test(b"occupant").expect("set test");
        let state = AppState {
            storage: Arc::new(storage),
            ..state
        };

        let router = make_router(state);
        let response = router
            .oneshot(events_request(Some(&format!("Secret {SECRET_B64}"))))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = body_json(response).await;
        assert_eq!(value["error"], "could not create test");
    }

    #[tokio::test]
    async fn host_guard_rejects_foreign_domains() {
        let router = make_router(test_state(Some("oast.example.com")));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "evil.example.org")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "OAST.Example.COM:2096")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_endpoint_reports_store_counters() {
        let state = test_state(None);
        state.storage.set_test(b"some secret").expect("set test");

        let router = make_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/status-7a918a")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["storedTests"], 1);
        assert_eq!(value["storedEvents"], 0);
        assert!(value["residentSetSizeBytes"].as_u64().is_some());
        assert!(value["openFileDescriptors"].as_u64().is_some());
        assert!(value["openFileDescriptorsLimit"].as_u64().is_some());
    }

    #[tokio::test]
    async fn home_page_is_served_without_authentication() {
        let router = make_router(test_state(None));

        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
