use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::AppState;
use crate::http::ApiError;

/// Maximum decoded length of the shared secret, in bytes.
const SECRET_MAX_SIZE: usize = 44;

/// Identity derived from the `Authorization: Secret <base64>` header.
///
/// Inserted into the request extensions once the secret has been accepted
/// and the test registered.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    pub id: String,
    pub canary: String,
}

/// Authenticates `/events` requests, registering the test on first use.
///
/// Capacity exhaustion is deliberately indistinguishable from a bad secret:
/// both surface as 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if auth.is_empty() {
        return Err(ApiError::unauthorized("the Authorization header is missing"));
    }

    let mut tokens = auth.split(' ');
    let (Some(auth_type), Some(b64_secret), None) = (tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(ApiError::unauthorized("wrong authorization format"));
    };

    if auth_type != "Secret" {
        return Err(ApiError::unauthorized("unsupported authorization type"));
    }

    if base64::decoded_len_estimate(b64_secret.len()) > SECRET_MAX_SIZE {
        return Err(ApiError::unauthorized(format!(
            "secret is too long; maximum is {SECRET_MAX_SIZE} bytes of decoded content"
        )));
    }

    let secret = BASE64_STANDARD
        .decode(b64_secret)
        .map_err(|error| ApiError::unauthorized("base64 error").with_source(error))?;

    let (id, canary) = state
        .storage
        .set_test(&secret)
        .map_err(|error| ApiError::unauthorized("could not create test").with_source(error))?;

    request.extensions_mut().insert(TestIdentity { id, canary });

    Ok(next.run(request).await)
}
