use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tidings_shared::ValidationError;
use tidings_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Request body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Storage(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::PayloadTooLarge { .. } | ServerError::BodyTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Storage(detail) => {
                tracing::error!(%detail, "storage failure surfaced to client");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage unavailable".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<ValidationError> for ServerError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::PayloadTooLarge { size, max } => {
                ServerError::PayloadTooLarge { size, max }
            }
            other => ServerError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("record".to_string()),
            StoreError::Conflict(msg) => ServerError::Validation(msg),
            StoreError::Validation(v) => v.into(),
            other => ServerError::Storage(other.to_string()),
        }
    }
}

/// Renames a generic not-found into the entity the caller was looking for.
pub trait NotFoundAs<T> {
    fn not_found_as(self, what: impl FnOnce() -> String) -> Result<T, ServerError>;
}

impl<T> NotFoundAs<T> for Result<T, ServerError> {
    fn not_found_as(self, what: impl FnOnce() -> String) -> Result<T, ServerError> {
        self.map_err(|e| match e {
            ServerError::NotFound(_) => ServerError::NotFound(what()),
            other => other,
        })
    }
}

/// Rolling cache failures. Callers treat every variant as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache call exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("cached entry is not decodable: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Bus and live-connection failures. Logged, never surfaced to senders.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bus error: {0}")]
    Bus(String),

    #[error("connection {0} outbox is full")]
    OutboxFull(u64),

    #[error("connection {0} is closed")]
    Closed(u64),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        TransportError::Bus(err.to_string())
    }
}
