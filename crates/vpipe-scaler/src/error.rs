//! Controller error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type ScalerResult<T> = Result<T, ScalerError>;

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("Autoscaling is disabled")]
    Disabled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] vpipe_queue::QueueError),
}

impl ScalerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn batch(msg: impl Into<String>) -> Self {
        Self::Batch(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ScalerError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            ScalerError::Validation(_) => StatusCode::BAD_REQUEST,
            ScalerError::Batch(_) | ScalerError::Queue(_) => StatusCode::BAD_GATEWAY,
            ScalerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ScalerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
