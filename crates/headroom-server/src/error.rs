//! Error types for the HTTP server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use headroom_core::{AdmissionError, RejectReason};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request body could not be decoded.
    #[error("{0}")]
    MalformedBody(String),

    /// Every node is at its limit.
    #[error("{0}")]
    AtCapacity(RejectReason),

    /// Resource not found.
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The usage store failed or timed out.
    #[error("usage store unavailable: {0}")]
    StoreUnavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            // The admission endpoint answers these two in plain text.
            Self::MalformedBody(message) => return (StatusCode::BAD_REQUEST, message.clone()).into_response(),
            Self::AtCapacity(reason) => return (StatusCode::TOO_MANY_REQUESTS, reason.to_string()).into_response(),
            Self::NotFound(_, _) => (StatusCode::NOT_FOUND, "not_found"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            Self::BindFailed(_, _) | Self::Config(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<AdmissionError> for ServerError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::NotFound(node) => Self::NotFound("node".to_string(), node.to_string()),
            AdmissionError::InvalidNodeId(message) => Self::InvalidRequest(message),
            AdmissionError::InvalidLimit { .. } | AdmissionError::Config(_) => Self::Config(err.to_string()),
            AdmissionError::StoreUnavailable(_) | AdmissionError::StoreTimeout { .. } => {
                Self::StoreUnavailable(err.to_string())
            }
        }
    }
}
