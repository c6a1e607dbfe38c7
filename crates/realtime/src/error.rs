use coordination::StoreError;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("not allowed: {0}")]
    Authorization(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("infrastructure unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for RealtimeError {
    fn from(value: StoreError) -> Self {
        RealtimeError::Unavailable(value.to_string())
    }
}

impl From<anyhow::Error> for RealtimeError {
    fn from(value: anyhow::Error) -> Self {
        RealtimeError::Unavailable(format!("{value:#}"))
    }
}

impl From<RealtimeError> for ApiError {
    fn from(value: RealtimeError) -> Self {
        let message = value.to_string();
        match value {
            RealtimeError::Authentication(_) => ApiError::new(ErrorCode::Unauthorized, message),
            RealtimeError::Authorization(_) => ApiError::new(ErrorCode::Forbidden, message),
            RealtimeError::Validation(_) => ApiError::new(ErrorCode::Validation, message),
            RealtimeError::RateLimited { retry_after_ms } => {
                ApiError::rate_limited(message, retry_after_ms)
            }
            RealtimeError::NotFound(_) => ApiError::new(ErrorCode::NotFound, message),
            RealtimeError::Unavailable(_) => ApiError::new(ErrorCode::Unavailable, message),
        }
    }
}
