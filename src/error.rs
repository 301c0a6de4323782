//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache, its lock manager and expiry engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Lock on a key was not granted before the deadline
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// The caller stopped existing while it waited for a lock
    #[error("Caller {0} terminated while waiting for a lock")]
    CallerTerminated(String),

    /// Operation not supported by the configured storage mode
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A background actor (lock shard or expiry engine) has stopped
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::LockTimeout(_) => StatusCode::CONFLICT,
            CacheError::CallerTerminated(_) => StatusCode::GONE,
            CacheError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            CacheError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
