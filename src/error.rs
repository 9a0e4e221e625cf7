//! Error handling for the stream engine
//!
//! Variants follow the failure taxonomy of a stream session:
//! transient transport failures are retried by the supervisor,
//! everything else ends the session.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection drop, timeout, broker/pipeline loss (retried)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence write/read failed (frame must not be acknowledged)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Inference collaborator failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Alert dispatch failed
    #[error("Alert error: {0}")]
    Alert(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (e.g. stream already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Parse error (frame headers, payloads)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the supervisor should retry the session instead of terminating it
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Whether this is a persistence failure
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Sqlx(_))
    }
}

/// Broker failures are connection-level: always retried
impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Transport(format!("AMQP: {}", e))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::Transport(msg) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR", msg.clone()),
            Error::Persistence(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                msg.clone(),
            ),
            Error::Inference(msg) => (StatusCode::BAD_GATEWAY, "INFERENCE_ERROR", msg.clone()),
            Error::Alert(msg) => (StatusCode::BAD_GATEWAY, "ALERT_ERROR", msg.clone()),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Parse(msg) => (StatusCode::BAD_REQUEST, "PARSE_ERROR", msg.clone()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Sqlx(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                e.to_string(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(!Error::Persistence("write failed".into()).is_transient());
        assert!(!Error::Internal("boom".into()).is_transient());
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let resp = Error::Conflict("CAM-01 already running".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
