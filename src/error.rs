//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Webhook arrived for a node name that is not configured.
    #[error("Unknown source node: {0}")]
    UnknownSource(String),

    /// Webhook body could not be parsed into a notification.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Node error: {0}")]
    Node(#[from] crate::services::node_client::NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map error variant to HTTP status code and machine-readable error code.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Sqlx(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Self::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MIGRATION_ERROR"),
            Self::UnknownSource(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SOURCE"),
            Self::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD"),
            Self::Node(_) => (StatusCode::BAD_GATEWAY, "NODE_ERROR"),
            Self::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::AddrParse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ADDR_PARSE_ERROR"),
            Self::Json(_) => (StatusCode::BAD_REQUEST, "JSON_ERROR"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Return a user-facing message. Internal details are hidden for
    /// wrapped foreign errors (Sqlx, Io, etc.) to avoid leaking internals.
    fn user_message(&self) -> String {
        match self {
            Self::Sqlx(_) => "Database operation failed".to_string(),
            Self::Migration(_) => "Database migration failed".to_string(),
            Self::Io(_) => "IO operation failed".to_string(),
            Self::AddrParse(_) => "Invalid address".to_string(),
            Self::Json(_) => "Invalid JSON".to_string(),
            // All other variants carry their own user-facing message
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.user_message();

        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_maps_to_404() {
        let (status, code) = AppError::UnknownSource("wan".into()).status_and_code();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "UNKNOWN_SOURCE");
    }

    #[test]
    fn test_malformed_payload_maps_to_400() {
        let (status, code) = AppError::MalformedPayload("bad".into()).status_and_code();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "MALFORMED_PAYLOAD");
    }

    #[test]
    fn test_database_message_is_opaque() {
        let err = AppError::Sqlx(sqlx::Error::PoolClosed);
        assert_eq!(err.user_message(), "Database operation failed");
    }

    #[test]
    fn test_unknown_source_message_names_node() {
        let err = AppError::UnknownSource("attic".into());
        assert!(err.user_message().contains("attic"));
    }
}
