use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("LLM backend unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            EngineError::InvalidInput(msg) => {
                tracing::warn!("Invalid input: {}", msg);
                (StatusCode::BAD_REQUEST, "InvalidInput", msg)
            }
            EngineError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            EngineError::DimensionMismatch { expected, actual } => {
                tracing::error!("Dimension mismatch: expected {}, got {}", expected, actual);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "DimensionMismatch",
                    format!("expected {}, got {}", expected, actual),
                )
            }
            EngineError::Persistence(msg) => {
                tracing::error!("Persistence error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "PersistenceError", msg)
            }
            EngineError::EmbeddingUnavailable(msg) => {
                tracing::error!("Embedding unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "EmbeddingUnavailable", msg)
            }
            EngineError::UpstreamUnavailable(msg) => {
                tracing::error!("Upstream unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "UpstreamUnavailable", msg)
            }
            EngineError::Cancelled => {
                tracing::debug!("Request cancelled by client");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Cancelled",
                    "request cancelled".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
