//! Error types for FeatureHub.
//!
//! One enum covers every failure class the subsystems surface; the HTTP layer
//! maps variants to status codes, batch paths map them into per-result error
//! strings instead of failing the whole call.

use thiserror::Error;

/// Common result type for FeatureHub operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Key absent from the queried tier or from metadata.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request deadline exceeded.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// A store, cache, or bus backend failed while reachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Migration claim lost to a concurrent claimer.
    #[error("migration conflict for key: {0}")]
    Conflict(String),

    /// Malformed key, oversize batch, unknown tier/hint.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invariant breach or unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn backend(msg: impl Into<String>) -> Self {
        Error::BackendUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("metadata row not found".to_string()),
            other => Error::BackendUnavailable(format!("metadata store: {other}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}
