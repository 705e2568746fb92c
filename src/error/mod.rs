use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::topic::Topic;

/// Per-connection error taxonomy.
///
/// Every variant has a stable reason code that is sent to the peer inside
/// `error` envelopes. Only `HeartbeatTimeout` and `TransportError` are fatal
/// to the connection they concern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Invalid subscription type: {0}")]
    InvalidTopic(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid message format: {0}")]
    MalformedMessage(String),

    #[error("Heartbeat timeout after {missed} missed beats")]
    HeartbeatTimeout { missed: u32 },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Failed to fetch initial data for {topic}: {message}")]
    SnapshotFetchFailed { topic: Topic, message: String },
}

impl HubError {
    /// Reason code carried in `error` envelopes
    pub fn reason(&self) -> &'static str {
        match self {
            HubError::InvalidTopic(_) => "InvalidTopic",
            HubError::RateLimitExceeded => "RateLimitExceeded",
            HubError::MalformedMessage(_) => "MalformedMessage",
            HubError::HeartbeatTimeout { .. } => "HeartbeatTimeout",
            HubError::TransportError(_) => "TransportError",
            HubError::SnapshotFetchFailed { .. } => "SnapshotFetchFailed",
        }
    }

    /// Whether the error ends the connection it concerns
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HubError::HeartbeatTimeout { .. } | HubError::TransportError(_)
        )
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Hub(e) => {
                let status = if e.is_fatal() {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::BAD_REQUEST
                };
                (status, e.reason(), e.to_string(), e.to_string())
            }
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
        };

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::warn!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
