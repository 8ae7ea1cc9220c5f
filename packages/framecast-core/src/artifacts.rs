//! On-disk artifact contract between workers and the server.
//!
//! For every frame index a worker writes exactly two files into the
//! session's artifact directory: the processed PNG and a JSON stats sidecar.
//! The PNG lands first, so readers must tolerate the window where only one
//! of the pair is visible.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-frame stats written by the worker next to the processed PNG.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FrameStats {
    pub processing_time_ms: f64,
    pub memory_mb: f64,
    pub memory_delta_mb: f64,
    /// Filter actually applied; `"error"` when the worker exhausted retries
    /// and wrote the original frame instead.
    pub filter_applied: String,
    pub worker_id: String,
    pub hostname: String,
    /// Retries spent on this frame before it succeeded or gave up.
    #[serde(default)]
    pub retries: u32,
    /// Present only on permanent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FrameStats {
    /// Whether the worker gave up and fell back to the original frame.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.filter_applied == "error"
    }
}

/// Directory holding one session's artifacts.
pub fn session_dir(artifact_root: &Path, session_id: &str) -> PathBuf {
    artifact_root.join(session_id)
}

/// `frame_{index:06}.png` within the session directory.
pub fn frame_png_path(artifact_root: &Path, session_id: &str, index: u64) -> PathBuf {
    session_dir(artifact_root, session_id).join(format!("frame_{:06}.png", index))
}

/// `frame_{index:06}.json` within the session directory.
pub fn frame_stats_path(artifact_root: &Path, session_id: &str, index: u64) -> PathBuf {
    session_dir(artifact_root, session_id).join(format!("frame_{:06}.json", index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_use_six_digit_indices() {
        let root = Path::new("/data/frames");
        assert_eq!(
            frame_png_path(root, "ab12cd34", 7),
            PathBuf::from("/data/frames/ab12cd34/frame_000007.png")
        );
        assert_eq!(
            frame_stats_path(root, "ab12cd34", 123456),
            PathBuf::from("/data/frames/ab12cd34/frame_123456.json")
        );
    }

    #[test]
    fn error_stats_detected() {
        let ok = FrameStats {
            filter_applied: "blur_gaussian".into(),
            ..Default::default()
        };
        assert!(!ok.is_error());

        let failed = FrameStats {
            filter_applied: "error".into(),
            error: Some("decode failed".into()),
            ..Default::default()
        };
        assert!(failed.is_error());
    }
}
