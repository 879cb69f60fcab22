use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// JSON error envelope returned by the events API:
/// `{"status": "<reason>", "error": "<message>"}` with a matching HTTP
/// status code.
pub struct ApiError {
    pub code: StatusCode,
    pub error: String,
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ApiError {
    pub fn unauthorized(error: impl Into<String>) -> Self {
        Self {
            code: StatusCode::UNAUTHORIZED,
            error: error.into(),
            source: None,
        }
    }

    pub fn internal(error: impl Into<String>) -> Self {
        Self {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(source) = self.source.as_deref() {
            debug!(error = %source, "API error detail");
        }

        let status = self.code.canonical_reason().unwrap_or("Internal Server Error");
        let body = Json(serde_json::json!({
            "status": status,
            "error": self.error,
        }));

        (self.code, body).into_response()
    }
}
