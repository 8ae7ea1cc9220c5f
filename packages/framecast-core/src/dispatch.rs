//! Work dispatch: frame units of work onto the broker queue.
//!
//! The dispatcher only enqueues; completion is observed by the collector
//! through the artifact directory, never through the broker.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DISPATCH_RETRY_DELAYS_MS, FRAME_QUEUE};
use crate::error::{FramecastError, FramecastResult};

/// One frame's unit of work as it travels the queue.
///
/// PNG bytes are base64 inside the JSON envelope; the session id is echoed
/// into `params` so workers know the artifact directory and can key their
/// per-session caches.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkUnit {
    pub session_id: String,
    pub frame_index: u64,
    pub png_base64: String,
    pub processing: String,
    pub params: Value,
}

impl WorkUnit {
    pub fn new(
        session_id: &str,
        frame_index: u64,
        png: &[u8],
        processing: &str,
        mut params: Value,
    ) -> Self {
        if let Value::Object(ref mut map) = params {
            map.insert("session_id".into(), Value::String(session_id.into()));
        }
        Self {
            session_id: session_id.to_string(),
            frame_index,
            png_base64: BASE64.encode(png),
            processing: processing.to_string(),
            params,
        }
    }

    /// Decodes the PNG payload (worker side).
    pub fn png_bytes(&self) -> FramecastResult<Vec<u8>> {
        BASE64
            .decode(&self.png_base64)
            .map_err(|e| FramecastError::Decode(format!("work unit png: {}", e)))
    }
}

/// Handle returned from a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchHandle {
    pub frame_index: u64,
}

/// Publishes frame work onto the Redis queue with a bounded retry policy.
#[derive(Clone)]
pub struct FrameDispatcher {
    broker: ConnectionManager,
    queue: String,
}

impl FrameDispatcher {
    pub fn new(broker: ConnectionManager) -> Self {
        Self {
            broker,
            queue: FRAME_QUEUE.to_string(),
        }
    }

    /// Overrides the queue name (tests and multi-tenant deployments).
    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    /// Enqueues one unit of work. Tolerates broker hiccups with the shared
    /// retry ladder; fails with `Dispatch` once the ladder is exhausted.
    pub async fn dispatch(&self, unit: &WorkUnit) -> FramecastResult<DispatchHandle> {
        let payload = serde_json::to_string(unit).map_err(|e| FramecastError::Dispatch {
            index: unit.frame_index as usize,
            reason: format!("serialize: {}", e),
        })?;

        let mut last_error = None;
        for (attempt, &delay_ms) in std::iter::once(&0)
            .chain(DISPATCH_RETRY_DELAYS_MS.iter())
            .enumerate()
        {
            if attempt > 0 {
                log::info!(
                    "[Dispatch] [{}] Retrying frame {} (attempt {}/{}) after {}ms",
                    unit.session_id,
                    unit.frame_index,
                    attempt + 1,
                    DISPATCH_RETRY_DELAYS_MS.len() + 1,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let mut broker = self.broker.clone();
            match broker.lpush::<_, _, ()>(&self.queue, &payload).await {
                Ok(()) => {
                    return Ok(DispatchHandle {
                        frame_index: unit.frame_index,
                    })
                }
                Err(e) => {
                    log::warn!(
                        "[Dispatch] [{}] Broker push failed for frame {}: {}",
                        unit.session_id,
                        unit.frame_index,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(FramecastError::Dispatch {
            index: unit.frame_index as usize,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown broker error".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn work_unit_echoes_session_into_params() {
        let unit = WorkUnit::new(
            "ab12cd34",
            7,
            b"\x89PNG-ish",
            "motion",
            json!({"motion_type": "diff"}),
        );
        assert_eq!(unit.params["session_id"], "ab12cd34");
        assert_eq!(unit.params["motion_type"], "diff");
    }

    #[test]
    fn png_payload_round_trips() {
        let png = vec![1u8, 2, 3, 4, 255, 0];
        let unit = WorkUnit::new("s", 0, &png, "blur", json!({}));
        assert_eq!(unit.png_bytes().unwrap(), png);
    }

    #[test]
    fn queue_envelope_is_stable_json() {
        let unit = WorkUnit::new("s1", 3, b"x", "edges", json!({}));
        let encoded = serde_json::to_string(&unit).unwrap();
        let decoded: WorkUnit = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.session_id, "s1");
        assert_eq!(decoded.frame_index, 3);
        assert_eq!(decoded.processing, "edges");
        assert_eq!(decoded.png_bytes().unwrap(), b"x");
    }
}
