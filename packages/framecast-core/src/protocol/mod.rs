//! Client/server wire protocol.
//!
//! Every control message is a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON. Raw video bytes travel outside the frame
//! format; their length is advertised in a preceding JSON message.
//!
//! Messages are an internally tagged sum type on the `type` field, with one
//! union decoder at the codec boundary. Unknown tags decode to
//! [`Message::Unknown`] so the session layer can answer them explicitly
//! instead of tearing the connection down on a parse error.

mod codec;

pub use codec::{recv_bytes, recv_message, send_bytes, send_message};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source video metadata declared by the client in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    /// Original filename, for display only.
    pub filename: String,
    /// Declared size of the upload. Advisory: the write-side half-close is
    /// authoritative for the end of the stream.
    pub size_bytes: u64,
}

/// One protocol message, tagged by its `type` field on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message of a session; anything else is rejected.
    Handshake {
        version: u32,
        mode: String,
        codec: String,
        processing: String,
        #[serde(default)]
        filters: Vec<Value>,
        video_info: VideoInfo,
    },

    /// Server's reply to a valid handshake.
    HandshakeAck {
        accepted: bool,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
    },

    /// Periodic processing progress, monotonic in `frames_processed`.
    Progress {
        frames_processed: u64,
        frames_total: u64,
        fps: f64,
        eta_seconds: f64,
    },

    /// Terminal success message; followed on the wire by exactly
    /// `size_bytes` of raw output video.
    Result {
        ok: bool,
        output_path: String,
        size_bytes: u64,
        metrics: Value,
    },

    /// Terminal failure message.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },

    /// Any message whose `type` tag this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short tag name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::Progress { .. } => "progress",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_round_trips() {
        let msg = Message::Handshake {
            version: 1,
            mode: "stream".into(),
            codec: "mp4v".into(),
            processing: "blur".into(),
            filters: vec![],
            video_info: VideoInfo {
                filename: "clip.mp4".into(),
                size_bytes: 12345,
            },
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn tag_field_is_type() {
        let msg = Message::Progress {
            frames_processed: 30,
            frames_total: 150,
            fps: 12.5,
            eta_seconds: 9.6,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["frames_processed"], 30);
    }

    #[test]
    fn unknown_tag_decodes_to_unknown_variant() {
        let decoded: Message = serde_json::from_value(json!({"type": "hello"})).unwrap();
        assert_eq!(decoded, Message::Unknown);
    }

    #[test]
    fn ack_omits_absent_preview_url() {
        let msg = Message::HandshakeAck {
            accepted: true,
            session_id: "ab12cd34".into(),
            preview_url: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("preview_url").is_none());
    }
}
