use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure of one backend call. Recovered inside the orchestrator, never
/// shown to users.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("{op} unavailable: {detail}")]
    Unavailable { op: &'static str, detail: String },

    #[error("{op} overloaded: no permit available")]
    Overloaded { op: &'static str },
}

impl BackendError {
    pub fn unavailable(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            op,
            detail: err.to_string(),
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Timeout { op } | Self::Unavailable { op, .. } | Self::Overloaded { op } => *op,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("Message exceeds {0} characters")]
    MessageTooLong(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            e @ (ChatError::EmptyMessage | ChatError::MessageTooLong(_)) => {
                ApiError::BadRequest(e.to_string())
            }
            ChatError::SessionNotFound(id) => ApiError::NotFound(format!("session {}", id)),
            ChatError::InvariantViolation(msg) => ApiError::InternalError(msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::InternalError(msg) => {
                // Detail stays in the log.
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "The service is temporarily unavailable".to_string(),
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
