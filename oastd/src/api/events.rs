use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;

use crate::AppState;
use crate::event::Event;
use crate::http::ApiError;
use crate::middleware::auth::TestIdentity;

#[derive(Serialize)]
pub(crate) struct EventsResponse {
    id: String,
    canary: String,
    events: Vec<Event>,
}

/// Returns the authenticated test's identity and its recorded events.
///
/// The events array is always present; a test that exists but has seen no
/// interaction yields an empty list.
pub(super) async fn get_events(
    State(state): State<AppState>,
    identity: Option<Extension<TestIdentity>>,
) -> Result<Json<EventsResponse>, ApiError> {
    let Some(Extension(identity)) = identity else {
        // The authorization middleware always inserts the identity; reaching
        // this branch means the route was wired without it.
        return Err(ApiError::unauthorized("internal authentication error"));
    };

    let events = state.storage.load_events(&identity.id).unwrap_or_default();

    Ok(Json(EventsResponse {
        id: identity.id,
        canary: identity.canary,
        events,
    }))
}
