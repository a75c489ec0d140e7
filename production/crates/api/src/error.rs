//! Error types for the request layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diamondchain_notary::FinalityError;
use diamondchain_orchestrator::OrchestrationError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected input or a failed attempt; the body is the reason text
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Node is shutting down
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    InternalError(String),

    /// Notary refusal, returned as a structured body to the calling node
    #[error(transparent)]
    Finality(FinalityError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Finality(err) => {
                let status = match &err {
                    FinalityError::Conflict { .. } => StatusCode::CONFLICT,
                    FinalityError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, Json(err)).into_response()
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
            ApiError::InternalError(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::AttemptNotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestrationError::Shutdown => ApiError::Unavailable(err.to_string()),
            OrchestrationError::Storage(_) | OrchestrationError::Config(_) => {
                ApiError::InternalError(err.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<FinalityError> for ApiError {
    fn from(err: FinalityError) -> Self {
        ApiError::Finality(err)
    }
}
