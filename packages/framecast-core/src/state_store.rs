//! Session state in the shared key/value store.
//!
//! The orchestrator is the single writer for its session; the preview
//! surface and the session listing read without coordination. Every key
//! lives under `session:{id}:{field}` and carries a one-hour TTL refreshed
//! on each write.
//!
//! Publishing must never disturb the data path: every failure is logged at
//! warn and swallowed.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

use crate::constants::SESSION_STATE_TTL_SECS;
use crate::session::SessionStatus;
use crate::utils::now_secs;

/// Builds the Redis key for one session field.
pub fn state_key(session_id: &str, field: &str) -> String {
    format!("session:{}:{}", session_id, field)
}

/// Write half: owned by one orchestrator per session.
#[derive(Clone)]
pub struct StatePublisher {
    store: ConnectionManager,
}

impl StatePublisher {
    pub fn new(store: ConnectionManager) -> Self {
        Self { store }
    }

    /// Writes one field with the standard TTL. Failures are swallowed.
    pub async fn publish(&self, session_id: &str, field: &str, value: impl ToString) {
        let mut store = self.store.clone();
        let key = state_key(session_id, field);
        let result: redis::RedisResult<()> = store
            .set_ex(&key, value.to_string(), SESSION_STATE_TTL_SECS)
            .await;
        if let Err(e) = result {
            log::warn!("[State] [{}] Publish of {} failed: {}", session_id, field, e);
        }
    }

    /// Publishes the initial metadata block when dispatch begins.
    pub async fn publish_session_start(
        &self,
        session_id: &str,
        total_frames: u64,
        fps: f64,
        resolution: &str,
        processing: &str,
        video_name: &str,
    ) {
        self.publish(session_id, "total_frames", total_frames).await;
        self.publish(session_id, "fps", format!("{:.2}", fps)).await;
        self.publish(session_id, "resolution", resolution).await;
        self.publish(session_id, "processing_type", processing).await;
        self.publish(session_id, "video_name", video_name).await;
        self.publish(session_id, "start_time", now_secs()).await;
    }

    /// Publishes the lifecycle status.
    pub async fn publish_status(&self, session_id: &str, status: SessionStatus) {
        self.publish(session_id, "status", status.as_str()).await;
    }

    /// Publishes one progress tick.
    pub async fn publish_progress(
        &self,
        session_id: &str,
        frames_processed: u64,
        current_fps: f64,
        eta_seconds: f64,
    ) {
        self.publish(session_id, "frames_processed", frames_processed)
            .await;
        self.publish(session_id, "current_fps", format!("{:.2}", current_fps))
            .await;
        self.publish(session_id, "eta_seconds", format!("{:.1}", eta_seconds))
            .await;
    }

    /// Publishes the terminal record for a finished session.
    pub async fn publish_end(
        &self,
        session_id: &str,
        status: SessionStatus,
        total_time_seconds: f64,
    ) {
        self.publish_status(session_id, status).await;
        self.publish(session_id, "end_time", now_secs()).await;
        self.publish(
            session_id,
            "total_time_seconds",
            format!("{:.1}", total_time_seconds),
        )
        .await;
    }
}

/// One session's externally visible summary, as served by the preview API.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionSummary {
    pub session_id: String,
    pub video_name: String,
    pub processing_type: String,
    pub total_frames: u64,
    pub processed_frames: u64,
    /// Percent complete, 0–100.
    pub progress: f64,
    pub status: String,
    pub fps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
}

/// Read half: used by the preview surface. Reads are uncoordinated.
#[derive(Clone)]
pub struct StateReader {
    store: ConnectionManager,
}

impl StateReader {
    pub fn new(store: ConnectionManager) -> Self {
        Self { store }
    }

    async fn get(&self, session_id: &str, field: &str) -> Option<String> {
        let mut store = self.store.clone();
        store
            .get::<_, Option<String>>(state_key(session_id, field))
            .await
            .ok()
            .flatten()
    }

    /// Lists known session ids, newest first by `start_time`.
    pub async fn list_session_ids(&self) -> Vec<String> {
        let mut store = self.store.clone();
        let keys: Vec<String> = match store.keys("session:*:total_frames").await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("[State] Session enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let mut ids: Vec<(String, f64)> = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = key.split(':').nth(1).map(str::to_string) else {
                continue;
            };
            let start = self
                .get(&id, "start_time")
                .await
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            ids.push((id, start));
        }
        ids.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ids.into_iter().map(|(id, _)| id).collect()
    }

    /// Reads one session's summary. `None` when the session is unknown.
    ///
    /// fps/eta prefer the values the orchestrator published; fps falls back
    /// to an elapsed-time computation when `current_fps` is absent.
    pub async fn session_summary(&self, session_id: &str) -> Option<SessionSummary> {
        let total_frames: u64 = self.get(session_id, "total_frames").await?.parse().ok()?;

        let status = self
            .get(session_id, "status")
            .await
            .unwrap_or_else(|| "unknown".into());
        let processed_frames: u64 = self
            .get(session_id, "frames_processed")
            .await
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let start_time: Option<f64> = self
            .get(session_id, "start_time")
            .await
            .and_then(|s| s.parse().ok());

        let mut fps: f64 = self
            .get(session_id, "current_fps")
            .await
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        if fps == 0.0 {
            if let Some(start) = start_time {
                let elapsed = now_secs() - start;
                if elapsed >= 1.0 && processed_frames > 0 {
                    fps = processed_frames as f64 / elapsed;
                }
            }
        }

        let mut eta_seconds: Option<f64> = self
            .get(session_id, "eta_seconds")
            .await
            .and_then(|s| s.parse().ok());
        let mut total_time_seconds = None;
        if status == "completed" {
            eta_seconds = Some(0.0);
            total_time_seconds = self
                .get(session_id, "total_time_seconds")
                .await
                .and_then(|s| s.parse().ok());
        }

        let progress = if total_frames > 0 {
            (processed_frames as f64 / total_frames as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Some(SessionSummary {
            session_id: session_id.to_string(),
            video_name: self
                .get(session_id, "video_name")
                .await
                .unwrap_or_else(|| "unknown".into()),
            processing_type: self
                .get(session_id, "processing_type")
                .await
                .unwrap_or_else(|| "unknown".into()),
            total_frames,
            processed_frames,
            progress: (progress * 100.0).round() / 100.0,
            status,
            fps: (fps * 100.0).round() / 100.0,
            eta_seconds,
            total_time_seconds,
            start_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_keys_are_session_scoped() {
        assert_eq!(
            state_key("ab12cd34", "total_frames"),
            "session:ab12cd34:total_frames"
        );
    }

    #[test]
    fn ttl_is_at_most_one_hour() {
        assert!(SESSION_STATE_TTL_SECS <= 3600);
    }

    #[test]
    fn summary_serializes_without_absent_fields() {
        let summary = SessionSummary {
            session_id: "s".into(),
            total_frames: 10,
            status: "processing".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("eta_seconds").is_none());
        assert!(value.get("total_time_seconds").is_none());
    }
}
