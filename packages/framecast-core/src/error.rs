//! Centralized error types for the Framecast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to the wire-protocol error codes sent to clients
//! - Maps errors to HTTP status codes for the preview surface
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Framecast server.
#[derive(Debug, Error)]
pub enum FramecastError {
    /// Client opened with something other than a valid handshake.
    #[error("Invalid handshake: {0}")]
    Handshake(String),

    /// A message could not be serialized or exceeds the frame bound.
    #[error("Message encode failed: {0}")]
    Encode(String),

    /// An incoming frame was truncated, oversize, or not valid JSON.
    #[error("Message decode failed: {0}")]
    Decode(String),

    /// Socket read/write failed or the peer closed mid-transfer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The input video could not be opened or decoded.
    #[error("Video decode failed: {0}")]
    MediaDecode(String),

    /// The output encoder could not be opened or a write failed.
    #[error("Video encode failed: {0}")]
    MediaEncode(String),

    /// The broker refused a unit of work after retries.
    #[error("Dispatch failed for frame {index}: {reason}")]
    Dispatch { index: usize, reason: String },

    /// A frame's artifacts did not appear before the per-frame deadline.
    #[error("Frame {0} timed out waiting for worker artifacts")]
    FrameTimeout(usize),

    /// A worker exhausted its retries and surfaced a permanent failure.
    #[error("Worker permanently failed frame {0}")]
    WorkerPermanent(usize),

    /// State-store write failed. Never propagated into the data path.
    #[error("State publish failed: {0}")]
    StatePublish(String),

    /// Requested session does not exist (preview surface).
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Requested frame artifact does not exist (preview surface).
    #[error("Frame not found: session={session}, index={index}")]
    FrameNotFound { session: String, index: usize },

    /// Client sent an invalid or malformed request (preview surface).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server configuration error (bad bind spec, missing directories).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error that does not fit a more specific kind.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FramecastError {
    /// Returns the machine-readable error code.
    ///
    /// These codes travel in wire-protocol `error` messages and in preview
    /// API responses, so they are stable identifiers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "INVALID_HANDSHAKE",
            Self::Encode(_) | Self::Decode(_) => "PROTOCOL_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::MediaDecode(_) | Self::MediaEncode(_) => "PROCESSING_ERROR",
            Self::Dispatch { .. } => "DISPATCH_ERROR",
            Self::FrameTimeout(_) => "FRAME_TIMEOUT",
            Self::WorkerPermanent(_) => "WORKER_ERROR",
            Self::StatePublish(_) => "STATE_PUBLISH_ERROR",
            Self::SessionNotFound(_) => "session_not_found",
            Self::FrameNotFound { .. } => "frame_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the session can continue after this error.
    ///
    /// Per-frame errors fall back to the original frame and never abort a
    /// session; handshake, transport, and media errors are terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Dispatch { .. }
                | Self::FrameTimeout(_)
                | Self::WorkerPermanent(_)
                | Self::StatePublish(_)
        )
    }

    /// Maps the error to an HTTP status code for the preview surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::FrameNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type FramecastResult<T> = Result<T, FramecastError>;

/// JSON response body for preview API error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for FramecastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for FramecastError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FramecastError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<redis::RedisError> for FramecastError {
    fn from(err: redis::RedisError) -> Self {
        Self::StatePublish(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_uses_wire_code() {
        let err = FramecastError::Handshake("expected handshake".into());
        assert_eq!(err.code(), "INVALID_HANDSHAKE");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn per_frame_errors_are_recoverable() {
        assert!(FramecastError::FrameTimeout(3).is_recoverable());
        assert!(FramecastError::WorkerPermanent(3).is_recoverable());
        assert!(FramecastError::Dispatch {
            index: 0,
            reason: "broker down".into()
        }
        .is_recoverable());
        assert!(!FramecastError::Transport("reset".into()).is_recoverable());
    }

    #[test]
    fn preview_errors_map_to_http_status() {
        let err = FramecastError::SessionNotFound("abc123".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let err = FramecastError::InvalidRequest("bad index".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
