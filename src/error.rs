use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Source file missing: {0}")]
    InputMissing(String),

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("Deadline exceeded: {0}")]
    Deadline(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the work-queue retry policy should re-run a job that failed
    /// with this error. Deterministic failures are terminal.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            AppError::InputMissing(_)
                | AppError::Validation(_)
                | AppError::NotFound(_)
                | AppError::Deadline(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::InputMissing(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Cache(ref e) => {
                tracing::error!("Cache error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Broker(ref e) => {
                tracing::error!("Broker error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Broker unavailable".to_string())
            }
            AppError::Storage(ref msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            AppError::Encoder(ref msg) => {
                tracing::error!("Encoder error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encoding error".to_string())
            }
            AppError::Queue(ref msg) => {
                tracing::error!("Queue error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Queue error".to_string())
            }
            AppError::Streaming(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Deadline(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
