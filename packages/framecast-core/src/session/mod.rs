//! Session model and per-connection orchestration.

mod orchestrator;

pub use orchestrator::handle_connection;

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::VideoInfo;

/// Lifecycle of one session, published to the state store on transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Handshaking,
    Receiving,
    Dispatching,
    Awaiting,
    Encoding,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Receiving => "receiving",
            Self::Dispatching => "dispatching",
            Self::Awaiting => "awaiting",
            Self::Encoding => "encoding",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states end the preview SSE feed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Requested processing kind, from the handshake's `processing` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingKind {
    Blur,
    Faces,
    Edges,
    Motion,
    Custom,
    /// Anything unrecognized passes frames through unmodified.
    None,
}

impl ProcessingKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "blur" => Self::Blur,
            "faces" => Self::Faces,
            "edges" => Self::Edges,
            "motion" => Self::Motion,
            "custom" => Self::Custom,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blur => "blur",
            Self::Faces => "faces",
            Self::Edges => "edges",
            Self::Motion => "motion",
            Self::Custom => "custom",
            Self::None => "none",
        }
    }
}

/// One client connection and the processing job it requested.
///
/// Created after a valid handshake, owned exclusively by its orchestrator,
/// and destroyed when the connection closes.
pub struct Session {
    pub id: String,
    pub peer: SocketAddr,
    pub processing: ProcessingKind,
    pub codec: String,
    pub filters: Vec<Value>,
    pub video_info: VideoInfo,
    pub started: Instant,
}

impl Session {
    /// Address family name for logs, matching what the client forced.
    pub fn family(&self) -> &'static str {
        if self.peer.is_ipv6() {
            "IPv6"
        } else {
            "IPv4"
        }
    }

    /// Parameters forwarded with each unit of work.
    pub fn work_params(&self) -> Value {
        serde_json::json!({ "filters": self.filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_state_store_values() {
        assert_eq!(SessionStatus::Dispatching.as_str(), "dispatching");
        assert_eq!(SessionStatus::Completed.as_str(), "completed");
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Awaiting.is_terminal());
    }

    #[test]
    fn processing_kind_parses_known_values() {
        assert_eq!(ProcessingKind::parse("blur"), ProcessingKind::Blur);
        assert_eq!(ProcessingKind::parse("motion"), ProcessingKind::Motion);
        assert_eq!(ProcessingKind::parse("sharpen"), ProcessingKind::None);
    }

    #[test]
    fn family_detects_peer_address() {
        let session = Session {
            id: "ab12cd34".into(),
            peer: "[::1]:5000".parse().unwrap(),
            processing: ProcessingKind::Blur,
            codec: "mp4v".into(),
            filters: vec![],
            video_info: crate::protocol::VideoInfo {
                filename: "x.mp4".into(),
                size_bytes: 1,
            },
            started: Instant::now(),
        };
        assert_eq!(session.family(), "IPv6");
    }
}
