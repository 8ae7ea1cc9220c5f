//! Worker body: drains frame work from the queue, applies the requested
//! filter, and materializes the artifact pair.
//!
//! Workers are stateless per frame except for two caches: the face detector
//! (one per worker process) and the motion baseline (one per session id).
//! Transient failures retry up to [`WORKER_MAX_RETRIES`] times with a fixed
//! delay; a permanent failure still writes the decoded original frame plus a
//! stats record whose `filter_applied` is `"error"`.

pub mod filters;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{frame_png_path, frame_stats_path, session_dir, FrameStats};
use crate::constants::{WORKER_MAX_RETRIES, WORKER_RETRY_DELAY};
use crate::dispatch::WorkUnit;
use crate::error::{FramecastError, FramecastResult};
use crate::media::Frame;
use crate::session::ProcessingKind;
use crate::utils::current_rss_mb;
use filters::{FaceDetector, MotionDetector};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub queue: String,
    pub artifact_root: PathBuf,
}

/// Caches that survive across frames.
struct WorkerCaches {
    face_detector: FaceDetector,
    /// Session id → motion baseline. Entries live as long as the worker;
    /// sessions are short compared to worker lifetime.
    motion_detectors: HashMap<String, MotionDetector>,
}

/// Runs the consume loop until `shutdown` fires.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> FramecastResult<()> {
    let client = redis::Client::open(config.redis_url.as_str())
        .map_err(|e| FramecastError::Configuration(format!("redis url: {}", e)))?;
    let mut broker = ConnectionManager::new(client)
        .await
        .map_err(|e| FramecastError::Configuration(format!("redis connect: {}", e)))?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    log::info!(
        "[Worker] {} consuming queue '{}' (artifacts at {})",
        host,
        config.queue,
        config.artifact_root.display()
    );

    let caches = Arc::new(Mutex::new(WorkerCaches {
        face_detector: FaceDetector::new(),
        motion_detectors: HashMap::new(),
    }));

    loop {
        if shutdown.is_cancelled() {
            log::info!("[Worker] Shutdown requested, stopping consume loop");
            return Ok(());
        }

        // Short BRPOP timeout keeps shutdown responsive without busy-polling.
        let popped = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = broker.brpop::<_, Option<(String, String)>>(&config.queue, 1.0) => {
                match result {
                    Ok(popped) => popped,
                    Err(e) => {
                        log::warn!("[Worker] Broker read failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        None
                    }
                }
            }
        };

        let Some((_queue, payload)) = popped else {
            continue;
        };

        let unit: WorkUnit = match serde_json::from_str(&payload) {
            Ok(unit) => unit,
            Err(e) => {
                log::error!("[Worker] Dropping undecodable work unit: {}", e);
                continue;
            }
        };

        let caches = Arc::clone(&caches);
        let artifact_root = config.artifact_root.clone();
        let host = host.clone();
        let result = tokio::task::spawn_blocking(move || {
            process_unit(&unit, &artifact_root, &host, &caches)
        })
        .await;

        if let Err(e) = result {
            log::error!("[Worker] Frame task panicked: {}", e);
        }
    }
}

/// Processes one unit of work, including the retry ladder. Blocking.
fn process_unit(
    unit: &WorkUnit,
    artifact_root: &Path,
    host: &str,
    caches: &Arc<Mutex<WorkerCaches>>,
) {
    let started = Instant::now();
    let memory_start = current_rss_mb();
    let worker_id = uuid::Uuid::new_v4().simple().to_string();

    let png = match unit.png_bytes() {
        Ok(png) => png,
        Err(e) => {
            log::error!(
                "[Worker] [{}] Frame {} payload unusable: {}",
                unit.session_id,
                unit.frame_index,
                e
            );
            return;
        }
    };
    let original = match Frame::from_png(&png) {
        Ok(frame) => frame,
        Err(e) => {
            log::error!(
                "[Worker] [{}] Frame {} not decodable: {}",
                unit.session_id,
                unit.frame_index,
                e
            );
            return;
        }
    };

    let mut retries = 0u32;
    let outcome = loop {
        match apply_processing(unit, &original, caches) {
            Ok((frame, filter_name)) => break Ok((frame, filter_name)),
            Err(e) if retries < WORKER_MAX_RETRIES => {
                retries += 1;
                log::warn!(
                    "[Worker] [{}] Frame {} attempt {} failed: {} (retrying)",
                    unit.session_id,
                    unit.frame_index,
                    retries,
                    e
                );
                std::thread::sleep(WORKER_RETRY_DELAY);
            }
            Err(e) => break Err(e),
        }
    };

    let memory_end = current_rss_mb();
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (frame, stats) = match outcome {
        Ok((frame, filter_name)) => (
            frame,
            FrameStats {
                processing_time_ms: elapsed_ms,
                memory_mb: memory_end,
                memory_delta_mb: memory_end - memory_start,
                filter_applied: filter_name,
                worker_id,
                hostname: host.to_string(),
                retries,
                error: None,
            },
        ),
        Err(e) => {
            log::error!(
                "[Worker] [{}] Frame {} failed permanently after {} retries: {}",
                unit.session_id,
                unit.frame_index,
                retries,
                e
            );
            (
                original,
                FrameStats {
                    processing_time_ms: 0.0,
                    memory_mb: 0.0,
                    memory_delta_mb: 0.0,
                    filter_applied: "error".into(),
                    worker_id,
                    hostname: host.to_string(),
                    retries,
                    error: Some(e.to_string()),
                },
            )
        }
    };

    if let Err(e) = write_artifacts(unit, artifact_root, &frame, &stats) {
        log::error!(
            "[Worker] [{}] Frame {} artifact write failed: {}",
            unit.session_id,
            unit.frame_index,
            e
        );
    }
}

/// Applies the requested processing to one frame.
fn apply_processing(
    unit: &WorkUnit,
    original: &Frame,
    caches: &Arc<Mutex<WorkerCaches>>,
) -> FramecastResult<(Frame, String)> {
    match ProcessingKind::parse(&unit.processing) {
        ProcessingKind::Blur => {
            let (blur_type, kernel) = blur_params(&unit.params);
            let frame = filters::apply_blur(original, &blur_type, kernel)?;
            Ok((frame, format!("blur_{}", blur_type)))
        }
        ProcessingKind::Edges => {
            let edge_type = str_param(&unit.params, "edge_type", "sobel");
            let frame = filters::apply_edges(original, &edge_type)?;
            Ok((frame, format!("edges_{}", edge_type)))
        }
        ProcessingKind::Faces => {
            let caches = caches.lock();
            let frame = filters::detect_and_draw_faces(original, &caches.face_detector)?;
            Ok((frame, "face_detection".into()))
        }
        ProcessingKind::Motion => {
            let mut caches = caches.lock();
            let detector = caches
                .motion_detectors
                .entry(unit.session_id.clone())
                .or_insert_with(MotionDetector::new);
            let frame = detector.detect(original)?;
            Ok((frame, "motion_diff".into()))
        }
        ProcessingKind::Custom => apply_custom_pipeline(unit, original, caches),
        ProcessingKind::None => Ok((original.clone(), "none".into())),
    }
}

/// Ordered pipeline of named filters from the handshake's `filters` list.
///
/// Each entry is either a bare name (`"blur"`) or a `[name, params]` pair.
fn apply_custom_pipeline(
    unit: &WorkUnit,
    original: &Frame,
    caches: &Arc<Mutex<WorkerCaches>>,
) -> FramecastResult<(Frame, String)> {
    let specs = unit
        .params
        .get("filters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut frame = original.clone();
    let mut name = String::from("custom");
    for spec in &specs {
        let (filter, params) = match spec {
            Value::String(s) => (s.as_str(), Value::Null),
            Value::Array(parts) => (
                parts.first().and_then(Value::as_str).unwrap_or(""),
                parts.get(1).cloned().unwrap_or(Value::Null),
            ),
            _ => continue,
        };
        frame = match filter {
            "blur" => {
                let (blur_type, kernel) = blur_params(&params);
                filters::apply_blur(&frame, &blur_type, kernel)?
            }
            "edges" => filters::apply_edges(&frame, &str_param(&params, "edge_type", "sobel"))?,
            "faces" => {
                let caches = caches.lock();
                filters::detect_and_draw_faces(&frame, &caches.face_detector)?
            }
            other => {
                log::warn!(
                    "[Worker] [{}] Skipping unknown pipeline filter '{}'",
                    unit.session_id,
                    other
                );
                continue;
            }
        };
        name.push('_');
        name.push_str(filter);
    }
    Ok((frame, name))
}

fn blur_params(params: &Value) -> (String, u32) {
    let blur_type = str_param(params, "blur_type", "gaussian");
    let kernel = params
        .get("kernel")
        .and_then(Value::as_u64)
        .unwrap_or(31) as u32;
    (blur_type, kernel)
}

fn str_param(params: &Value, key: &str, default: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// Writes the artifact pair: PNG first, stats sidecar second.
fn write_artifacts(
    unit: &WorkUnit,
    artifact_root: &Path,
    frame: &Frame,
    stats: &FrameStats,
) -> FramecastResult<()> {
    let dir = session_dir(artifact_root, &unit.session_id);
    std::fs::create_dir_all(&dir)
        .map_err(|e| FramecastError::Internal(format!("artifact dir: {}", e)))?;

    let png_path = frame_png_path(artifact_root, &unit.session_id, unit.frame_index);
    std::fs::write(&png_path, frame.to_png()?)
        .map_err(|e| FramecastError::Internal(format!("write png: {}", e)))?;

    let stats_path = frame_stats_path(artifact_root, &unit.session_id, unit.frame_index);
    let encoded = serde_json::to_vec(stats)
        .map_err(|e| FramecastError::Internal(format!("encode stats: {}", e)))?;
    std::fs::write(&stats_path, encoded)
        .map_err(|e| FramecastError::Internal(format!("write stats: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_caches() -> Arc<Mutex<WorkerCaches>> {
        Arc::new(Mutex::new(WorkerCaches {
            face_detector: FaceDetector::new(),
            motion_detectors: HashMap::new(),
        }))
    }

    fn unit_for(processing: &str, params: Value) -> (WorkUnit, Frame) {
        let mut frame = Frame::zero(16, 16);
        for (i, byte) in frame.data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let png = frame.to_png().unwrap();
        (WorkUnit::new("sess1", 0, &png, processing, params), frame)
    }

    #[test]
    fn blur_unit_produces_named_filter() {
        let (unit, original) = unit_for("blur", json!({"blur_type": "gaussian", "kernel": 5}));
        let (frame, name) = apply_processing(&unit, &original, &test_caches()).unwrap();
        assert_eq!(name, "blur_gaussian");
        assert_eq!(frame.width, original.width);
    }

    #[test]
    fn unknown_processing_passes_through() {
        let (unit, original) = unit_for("sharpen", json!({}));
        let (frame, name) = apply_processing(&unit, &original, &test_caches()).unwrap();
        assert_eq!(name, "none");
        assert_eq!(frame, original);
    }

    #[test]
    fn motion_detector_is_cached_per_session() {
        let caches = test_caches();
        let (unit, original) = unit_for("motion", json!({}));
        apply_processing(&unit, &original, &caches).unwrap();
        apply_processing(&unit, &original, &caches).unwrap();
        assert_eq!(caches.lock().motion_detectors.len(), 1);
        assert!(caches.lock().motion_detectors.contains_key("sess1"));
    }

    #[test]
    fn custom_pipeline_chains_and_names_filters() {
        let (unit, original) = unit_for(
            "custom",
            json!({"filters": [["blur", {"kernel": 3}], "edges"]}),
        );
        let (_, name) = apply_processing(&unit, &original, &test_caches()).unwrap();
        assert_eq!(name, "custom_blur_edges");
    }

    #[test]
    fn artifacts_write_png_then_stats() {
        let dir = TempDir::new().unwrap();
        let (unit, frame) = unit_for("blur", json!({}));
        let stats = FrameStats {
            filter_applied: "blur_gaussian".into(),
            hostname: "host-a".into(),
            ..Default::default()
        };
        write_artifacts(&unit, dir.path(), &frame, &stats).unwrap();

        let png = frame_png_path(dir.path(), "sess1", 0);
        let sidecar = frame_stats_path(dir.path(), "sess1", 0);
        assert!(png.exists());
        assert!(sidecar.exists());

        let read_back: FrameStats =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(read_back.filter_applied, "blur_gaussian");
        let decoded = Frame::from_png(&std::fs::read(png).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
