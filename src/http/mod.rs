//! HTTP surfaces for the four subsystems.
//!
//! One axum router per subsystem, each served on its own port. Handlers stay
//! thin: parse, call the subsystem, map the error. Batch reads never fail as
//! a whole on per-key errors; the error enum maps onto status codes here and
//! nowhere else.

pub mod cleanup_api;
pub mod metadata_api;
pub mod migration_api;
pub mod query_api;
pub mod rate_limit;

pub use cleanup_api::cleanup_router;
pub use metadata_api::metadata_router;
pub use migration_api::migration_router;
pub use query_api::query_router;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::Error;

/// HTTP wrapper for the subsystem error enum.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.0.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}
