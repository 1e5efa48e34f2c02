use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream rejected action: {0}")]
    Upstream(String),

    #[error("sync engine unavailable")]
    EngineUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::EngineUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sync engine unavailable".to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Failures at the order REST boundary. `NotFound` is its own variant so
/// callers can treat an already-resolved order as benign.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("resource not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("no auth token available")]
    MissingToken,

    #[error("connect timed out")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error("action rejected: {0}")]
    Rejected(ApiError),

    #[error("action timed out")]
    Timeout,

    #[error("sync engine stopped")]
    EngineStopped,
}

impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::EngineStopped => AppError::EngineUnavailable,
            other => AppError::Upstream(other.to_string()),
        }
    }
}
