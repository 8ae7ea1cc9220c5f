//! Per-session processing metrics.
//!
//! One [`MetricsCollector`] lives for the duration of a session, owned by
//! its orchestrator and shared with the assembly thread. Counters are
//! monotonically non-decreasing and the latency sample list is append-only.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Progress snapshot sent to the client and published to the state store.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub frames_processed: u64,
    pub frames_total: u64,
    pub fps: f64,
    pub eta_seconds: f64,
}

/// Per-worker-host tallies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerTally {
    pub frames_processed: u64,
    pub total_time_ms: f64,
    pub total_memory_mb: f64,
}

#[derive(Default)]
struct MetricsInner {
    frames_processed: u64,
    frames_total: u64,
    frames_failed: u64,
    retries: u64,
    /// Successful per-frame processing latencies (ms), append-only.
    latencies: Vec<f64>,
    worker_stats: HashMap<String, WorkerTally>,
    filters_applied: HashMap<String, u64>,
}

/// Thread-safe metrics collector for one session.
///
/// FPS and ETA are computed from live wall-clock elapsed since construction,
/// not from latency averages; both are zero when undefined (no frames done
/// yet, or no total known).
pub struct MetricsCollector {
    start: Instant,
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// Records one completed frame.
    ///
    /// Failed frames increment `frames_failed` and do not contribute a
    /// latency sample, so `frames_processed == frames_failed + samples`.
    pub fn record_frame(
        &self,
        processing_ms: f64,
        worker_host: Option<&str>,
        filter_applied: Option<&str>,
        memory_mb: f64,
        failed: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.frames_processed += 1;

        if failed {
            inner.frames_failed += 1;
        } else {
            inner.latencies.push(processing_ms);
        }

        if let Some(host) = worker_host {
            let tally = inner.worker_stats.entry(host.to_string()).or_default();
            tally.frames_processed += 1;
            tally.total_time_ms += processing_ms;
            tally.total_memory_mb += memory_mb;
        }

        if let Some(filter) = filter_applied {
            *inner.filters_applied.entry(filter.to_string()).or_default() += 1;
        }
    }

    /// Records one worker retry observed in frame stats.
    pub fn record_retry(&self) {
        self.inner.lock().retries += 1;
    }

    /// Sets the denominator for progress and ETA.
    pub fn set_total_frames(&self, total: u64) {
        self.inner.lock().frames_total = total;
    }

    pub fn frames_processed(&self) -> u64 {
        self.inner.lock().frames_processed
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> ProgressSnapshot {
        let inner = self.inner.lock();
        let elapsed = self.start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            inner.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        let eta_seconds = if fps > 0.0 && inner.frames_total > inner.frames_processed {
            (inner.frames_total - inner.frames_processed) as f64 / fps
        } else {
            0.0
        };
        ProgressSnapshot {
            frames_processed: inner.frames_processed,
            frames_total: inner.frames_total,
            fps,
            eta_seconds,
        }
    }

    /// Linear-interpolation percentile over the latency samples.
    ///
    /// Returns 0 on an empty sample; otherwise the result is bounded by the
    /// sample's min and max.
    pub fn percentile(&self, p: f64) -> f64 {
        let inner = self.inner.lock();
        percentile_of(&inner.latencies, p)
    }

    /// Full metrics report for the terminal `result` message.
    pub fn summary(&self) -> Value {
        let inner = self.inner.lock();
        let elapsed = self.start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            inner.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        let (avg, min, max) = if inner.latencies.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = inner.latencies.iter().sum();
            let min = inner.latencies.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = inner
                .latencies
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            (sum / inner.latencies.len() as f64, min, max)
        };

        serde_json::json!({
            "total_frames": inner.frames_total,
            "frames_processed": inner.frames_processed,
            "frames_failed": inner.frames_failed,
            "retries": inner.retries,
            "processing_time_seconds": elapsed,
            "fps_processing": fps,
            "latency_p50_ms": percentile_of(&inner.latencies, 50.0),
            "latency_p95_ms": percentile_of(&inner.latencies, 95.0),
            "latency_p99_ms": percentile_of(&inner.latencies, 99.0),
            "latency_avg_ms": avg,
            "latency_min_ms": min,
            "latency_max_ms": max,
            "worker_count": inner.worker_stats.len(),
            "filters_applied": inner.filters_applied.clone(),
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile_of(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let k = (sorted.len() - 1) as f64 * p / 100.0;
    let f = k.floor() as usize;
    let c = f + 1;
    if c >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_percentile_is_zero() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.percentile(50.0), 0.0);
        assert_eq!(metrics.percentile(99.0), 0.0);
    }

    #[test]
    fn percentile_bounded_by_min_and_max() {
        let metrics = MetricsCollector::new();
        for ms in [5.0, 100.0, 20.0, 50.0, 80.0] {
            metrics.record_frame(ms, Some("w1"), Some("blur_gaussian"), 10.0, false);
        }
        for p in [0.0, 25.0, 50.0, 95.0, 100.0] {
            let v = metrics.percentile(p);
            assert!((5.0..=100.0).contains(&v), "p{} = {} out of bounds", p, v);
        }
        assert_eq!(metrics.percentile(0.0), 5.0);
        assert_eq!(metrics.percentile(100.0), 100.0);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let metrics = MetricsCollector::new();
        for ms in [10.0, 20.0, 30.0, 40.0] {
            metrics.record_frame(ms, None, None, 0.0, false);
        }
        // k = 3 * 0.5 = 1.5 → halfway between 20 and 30.
        assert!((metrics.percentile(50.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn processed_equals_failed_plus_samples() {
        let metrics = MetricsCollector::new();
        for i in 0..20 {
            metrics.record_frame(12.0, Some("w1"), None, 0.0, i % 5 == 0);
        }
        let summary = metrics.summary();
        let processed = summary["frames_processed"].as_u64().unwrap();
        let failed = summary["frames_failed"].as_u64().unwrap();
        assert_eq!(processed, 20);
        assert_eq!(failed, 4);
        // Latency samples come only from successes.
        assert_eq!(processed, failed + 16);
        assert!(summary["latency_p95_ms"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn progress_is_monotonic() {
        let metrics = MetricsCollector::new();
        metrics.set_total_frames(10);
        let mut last = 0;
        for _ in 0..10 {
            metrics.record_frame(1.0, None, None, 0.0, false);
            let snap = metrics.progress();
            assert!(snap.frames_processed >= last);
            last = snap.frames_processed;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn eta_zero_when_done_or_undefined() {
        let metrics = MetricsCollector::new();
        // No total, no frames: fps may be 0, eta must be 0.
        assert_eq!(metrics.progress().eta_seconds, 0.0);

        metrics.set_total_frames(2);
        metrics.record_frame(1.0, None, None, 0.0, false);
        metrics.record_frame(1.0, None, None, 0.0, false);
        // Everything done: no remaining work.
        assert_eq!(metrics.progress().eta_seconds, 0.0);
    }

    #[test]
    fn worker_tallies_count_unique_hosts() {
        let metrics = MetricsCollector::new();
        metrics.record_frame(5.0, Some("host-a"), Some("edges_sobel"), 1.0, false);
        metrics.record_frame(6.0, Some("host-a"), Some("edges_sobel"), 1.0, false);
        metrics.record_frame(7.0, Some("host-b"), Some("edges_sobel"), 1.0, false);
        let summary = metrics.summary();
        assert_eq!(summary["worker_count"], 2);
        assert_eq!(summary["filters_applied"]["edges_sobel"], 3);
    }
}
