//! Runtime context shared by every orchestrator.
//!
//! Instead of global singletons for the broker and the state store, the
//! server builds one [`RuntimeContext`] at startup and hands it by reference
//! to each accepted connection: broker publisher handle, state store
//! handles, directory roots, configured timeouts, and the preview URL
//! builder.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::constants::{FRAME_COLLECT_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::dispatch::FrameDispatcher;
use crate::error::{FramecastError, FramecastResult};
use crate::state_store::{StatePublisher, StateReader};

/// Default broker/state-store URL when `REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379/0";

/// Timeouts governing one session, overridable for tests.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    pub frame_collect: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT,
            frame_collect: FRAME_COLLECT_TIMEOUT,
        }
    }
}

/// Everything a session orchestrator needs, constructed once at startup.
#[derive(Clone)]
pub struct RuntimeContext {
    pub dispatcher: FrameDispatcher,
    pub state: StatePublisher,
    pub state_reader: StateReader,
    /// Root for per-session artifact directories (`data/frames`).
    pub artifact_root: PathBuf,
    /// Root for session input/output videos and cached previews.
    pub work_root: PathBuf,
    /// Output codec name (`mp4v` unless configured otherwise).
    pub codec: String,
    pub timeouts: SessionTimeouts,
    /// Advertised base of the preview surface, e.g. `http://10.0.0.5:8080`.
    pub preview_base_url: Option<String>,
}

impl RuntimeContext {
    /// Connects to the broker/state store and prepares directory roots.
    pub async fn connect(
        redis_url: &str,
        data_dir: &Path,
        codec: &str,
        preview_port: u16,
    ) -> FramecastResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| FramecastError::Configuration(format!("redis url: {}", e)))?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            FramecastError::Configuration(format!("redis connect ({}): {}", redis_url, e))
        })?;
        log::info!("[Context] Connected to broker/state store at {}", redis_url);

        let artifact_root = data_dir.join("frames");
        let work_root = data_dir.to_path_buf();
        tokio::fs::create_dir_all(&artifact_root)
            .await
            .map_err(|e| FramecastError::Configuration(format!("artifact root: {}", e)))?;
        tokio::fs::create_dir_all(work_root.join("gifs"))
            .await
            .map_err(|e| FramecastError::Configuration(format!("gif cache: {}", e)))?;

        let preview_base_url = detect_preview_base(preview_port);

        Ok(Self {
            dispatcher: FrameDispatcher::new(manager.clone()),
            state: StatePublisher::new(manager.clone()),
            state_reader: StateReader::new(manager),
            artifact_root,
            work_root,
            codec: codec.to_string(),
            timeouts: SessionTimeouts::default(),
            preview_base_url,
        })
    }

    /// Session input video path: `input_{id}.mp4` under the work root.
    pub fn input_path(&self, session_id: &str) -> PathBuf {
        self.work_root.join(format!("input_{}.mp4", session_id))
    }

    /// Session output video path: `output_{id}.mp4` under the work root.
    pub fn output_path(&self, session_id: &str) -> PathBuf {
        self.work_root.join(format!("output_{}.mp4", session_id))
    }

    /// Preview status URL advertised in the handshake ack, when the local
    /// IP could be detected.
    pub fn preview_url(&self, session_id: &str) -> Option<String> {
        self.preview_base_url
            .as_ref()
            .map(|base| format!("{}/session/{}/status", base, session_id))
    }
}

/// Best-effort detection of the preview base URL.
///
/// A missing local IP only degrades the handshake ack (no preview link),
/// never the session.
fn detect_preview_base(preview_port: u16) -> Option<String> {
    match local_ip_address::local_ip() {
        Ok(ip) => Some(preview_base_for(ip, preview_port)),
        Err(e) => {
            log::warn!("[Context] Local IP detection failed: {}", e);
            None
        }
    }
}

/// `http://{ip}:{port}`, bracketing IPv6 literals.
fn preview_base_for(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V6(v6) => format!("http://[{}]:{}", v6, port),
        IpAddr::V4(v4) => format!("http://{}:{}", v4, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_contract() {
        let timeouts = SessionTimeouts::default();
        assert_eq!(timeouts.handshake, Duration::from_secs(30));
        assert_eq!(timeouts.frame_collect, Duration::from_secs(300));
    }

    #[test]
    fn preview_base_formats_both_families() {
        assert_eq!(
            preview_base_for("10.0.0.5".parse().unwrap(), 8080),
            "http://10.0.0.5:8080"
        );
        assert_eq!(
            preview_base_for("::1".parse().unwrap(), 8080),
            "http://[::1]:8080"
        );
    }
}
