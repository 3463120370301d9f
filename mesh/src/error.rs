//! Unified error handling for the mesh node.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::protocol::PeerId;

/// Transport-level failures on a single peer link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected to peer {0}")]
    NotConnected(PeerId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Mesh error type.
///
/// Unresolved conflicts are never errors; they are reported in sync results.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("Unknown peer: {0}")]
    PeerNotFound(PeerId),

    #[error("Checksum mismatch on message {0}")]
    IntegrityFailure(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Stale message {0}")]
    StaleMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for peer {0}")]
    Timeout(PeerId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl MeshError {
    /// Referenced record, conflict, version or peer is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            MeshError::Engine(e) => e.is_not_found(),
            MeshError::PeerNotFound(_) => true,
            _ => false,
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            e if e.is_not_found() => (StatusCode::NOT_FOUND, e.to_string(), None),
            MeshError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                (StatusCode::CONFLICT, e.to_string(), None)
            }
            MeshError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            MeshError::Link(e) => (StatusCode::BAD_GATEWAY, e.to_string(), None),
            MeshError::Timeout(peer) => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("peer {peer} did not answer"),
                None,
            ),
            other => {
                tracing::error!("Internal error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(other.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
