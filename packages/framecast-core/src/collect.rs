//! Result collection: watches a session's artifact directory and yields
//! processed frames as workers materialize them.
//!
//! Completion is observed purely through the filesystem; the dispatcher
//! never waits on the broker. A frame is ready when both halves of its
//! artifact pair exist and parse; until then the poller sleeps and retries.
//! Workers publish the pair non-atomically (PNG, then JSON), so read and
//! parse errors inside the deadline are treated as "not ready yet".

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};

use crate::artifacts::{frame_png_path, frame_stats_path, FrameStats};
use crate::constants::{COLLECT_POLL_INTERVAL, FRAME_COLLECT_TIMEOUT};
use crate::error::FramecastResult;
use crate::media::Frame;

/// One collected frame, or the sentinel for a frame that never arrived.
#[derive(Debug)]
pub struct FrameResult {
    pub index: u64,
    /// Decoded processed frame; `None` when collection timed out.
    pub frame: Option<Frame>,
    /// Worker stats; `None` when collection timed out.
    pub stats: Option<FrameStats>,
}

impl FrameResult {
    fn timed_out(index: u64) -> Self {
        Self {
            index,
            frame: None,
            stats: None,
        }
    }

    /// Whether the frame must be substituted with the original.
    ///
    /// True for collection timeouts and for worker permanent failures
    /// (stats with `filter_applied == "error"`).
    pub fn needs_fallback(&self) -> bool {
        match (&self.frame, &self.stats) {
            (Some(_), Some(stats)) => stats.is_error(),
            _ => true,
        }
    }
}

/// Polls one session's artifact directory.
#[derive(Clone)]
pub struct FrameCollector {
    artifact_root: PathBuf,
    session_id: String,
    poll_interval: Duration,
    frame_timeout: Duration,
}

impl FrameCollector {
    pub fn new(artifact_root: PathBuf, session_id: &str) -> Self {
        Self {
            artifact_root,
            session_id: session_id.to_string(),
            poll_interval: COLLECT_POLL_INTERVAL,
            frame_timeout: FRAME_COLLECT_TIMEOUT,
        }
    }

    /// Overrides the poll cadence and per-frame deadline (tests).
    pub fn with_timing(mut self, poll_interval: Duration, frame_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.frame_timeout = frame_timeout;
        self
    }

    /// Waits for one frame's artifact pair, decoding both halves.
    ///
    /// Returns the sentinel result on deadline instead of an error: a
    /// missing frame is a per-frame failure, never a session failure.
    pub async fn wait_one(&self, index: u64) -> FrameResult {
        let png = frame_png_path(&self.artifact_root, &self.session_id, index);
        let stats = frame_stats_path(&self.artifact_root, &self.session_id, index);

        let poll = async {
            loop {
                if let Some(result) = self.try_read_pair(index, &png, &stats).await {
                    return result;
                }
                sleep(self.poll_interval).await;
            }
        };

        match timeout(self.frame_timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "[Collect] [{}] Frame {} did not appear within {:?}",
                    self.session_id,
                    index,
                    self.frame_timeout
                );
                FrameResult::timed_out(index)
            }
        }
    }

    /// Collects many frames with bounded parallelism, returning results in
    /// ascending index order regardless of completion order. A timeout on
    /// one index yields its sentinel; the others are unaffected.
    pub async fn collect_all(&self, indices: Vec<u64>, concurrency: usize) -> Vec<FrameResult> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(indices.len());

        for index in indices {
            let collector = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // Semaphore closed only if the collector is dropped mid-wait.
                let _permit = semaphore.acquire_owned().await;
                collector.wait_one(index).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => log::error!("[Collect] [{}] Poll task panicked: {}", self.session_id, e),
            }
        }
        results.sort_by_key(|r| r.index);
        results
    }

    /// Streams `0..total` in ascending order, collecting one batch at a time
    /// so the consumer's backpressure bounds how far collection runs ahead.
    pub async fn stream_batches<F, Fut>(
        &self,
        total: u64,
        batch_size: usize,
        concurrency: usize,
        mut on_result: F,
    ) -> FramecastResult<()>
    where
        F: FnMut(FrameResult) -> Fut,
        Fut: std::future::Future<Output = FramecastResult<()>>,
    {
        let batch_size = batch_size.max(1) as u64;
        let mut start = 0u64;
        while start < total {
            let end = (start + batch_size).min(total);
            let batch: Vec<u64> = (start..end).collect();
            for result in self.collect_all(batch, concurrency).await {
                on_result(result).await?;
            }
            start = end;
        }
        Ok(())
    }

    /// One poll attempt: `Some` when both artifacts are present and parse.
    async fn try_read_pair(
        &self,
        index: u64,
        png: &std::path::Path,
        stats_path: &std::path::Path,
    ) -> Option<FrameResult> {
        // Cheap existence checks before paying for decode.
        if !(tokio::fs::try_exists(png).await.unwrap_or(false)
            && tokio::fs::try_exists(stats_path).await.unwrap_or(false))
        {
            return None;
        }

        let stats_raw = tokio::fs::read(stats_path).await.ok()?;
        // Parse failure here usually means the sidecar is mid-write.
        let stats: FrameStats = serde_json::from_slice(&stats_raw).ok()?;

        let png_path = png.to_path_buf();
        let frame = tokio::task::spawn_blocking(move || decode_png(&png_path))
            .await
            .ok()??;

        Some(FrameResult {
            index,
            frame: Some(frame),
            stats: Some(stats),
        })
    }
}

/// Decodes an artifact PNG into a packed RGB24 frame. Blocking.
fn decode_png(path: &std::path::Path) -> Option<Frame> {
    let bytes = std::fs::read(path).ok()?;
    Frame::from_png(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    const FAST_POLL: Duration = Duration::from_millis(10);
    const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

    fn collector_for(dir: &TempDir) -> FrameCollector {
        FrameCollector::new(dir.path().to_path_buf(), "testsess")
            .with_timing(FAST_POLL, SHORT_TIMEOUT)
    }

    fn write_artifact_pair(dir: &TempDir, index: u64, mark: u8) {
        let session = dir.path().join("testsess");
        std::fs::create_dir_all(&session).unwrap();

        let img = RgbImage::from_pixel(4, 4, image::Rgb([mark, mark, mark]));
        img.save(session.join(format!("frame_{:06}.png", index)))
            .unwrap();

        let stats = FrameStats {
            processing_time_ms: 12.0,
            filter_applied: "blur_gaussian".into(),
            worker_id: "w1".into(),
            hostname: "host-a".into(),
            ..Default::default()
        };
        std::fs::write(
            session.join(format!("frame_{:06}.json", index)),
            serde_json::to_vec(&stats).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn wait_one_returns_existing_pair() {
        let dir = TempDir::new().unwrap();
        write_artifact_pair(&dir, 0, 42);

        let result = collector_for(&dir).wait_one(0).await;
        assert!(!result.needs_fallback());
        assert_eq!(result.frame.unwrap().data[0], 42);
        assert_eq!(result.stats.unwrap().hostname, "host-a");
    }

    #[tokio::test]
    async fn wait_one_times_out_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let result = collector_for(&dir).wait_one(5).await;
        assert_eq!(result.index, 5);
        assert!(result.needs_fallback());
        assert!(result.frame.is_none());
    }

    #[tokio::test]
    async fn wait_one_tolerates_partial_writes() {
        let dir = TempDir::new().unwrap();
        let session = dir.path().join("testsess");
        std::fs::create_dir_all(&session).unwrap();
        // Only the PNG half exists, and the sidecar arrives later truncated
        // then complete; the poller must ride through both states.
        let img = RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9]));
        img.save(session.join("frame_000000.png")).unwrap();
        std::fs::write(session.join("frame_000000.json"), b"{\"processing_").unwrap();

        let collector = collector_for(&dir);
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let stats = FrameStats {
                filter_applied: "edges_sobel".into(),
                ..Default::default()
            };
            std::fs::write(
                session.join("frame_000000.json"),
                serde_json::to_vec(&stats).unwrap(),
            )
            .unwrap();
        });

        let result = collector.wait_one(0).await;
        writer.await.unwrap();
        assert!(!result.needs_fallback());
        assert_eq!(result.stats.unwrap().filter_applied, "edges_sobel");
    }

    #[tokio::test]
    async fn collect_all_orders_by_index() {
        let dir = TempDir::new().unwrap();
        for index in [3u64, 1, 0, 2] {
            write_artifact_pair(&dir, index, index as u8);
        }

        let results = collector_for(&dir).collect_all(vec![0, 1, 2, 3], 4).await;
        let indices: Vec<u64> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn collect_all_isolates_per_frame_timeouts() {
        let dir = TempDir::new().unwrap();
        write_artifact_pair(&dir, 0, 1);
        write_artifact_pair(&dir, 2, 3);
        // Index 1 never materializes.

        let results = collector_for(&dir).collect_all(vec![0, 1, 2], 2).await;
        assert_eq!(results.len(), 3);
        assert!(!results[0].needs_fallback());
        assert!(results[1].needs_fallback());
        assert!(!results[2].needs_fallback());
    }

    #[tokio::test]
    async fn stream_batches_visits_all_in_order() {
        let dir = TempDir::new().unwrap();
        for index in 0..5u64 {
            write_artifact_pair(&dir, index, index as u8);
        }

        let mut seen = Vec::new();
        collector_for(&dir)
            .stream_batches(5, 2, 2, |result| {
                seen.push(result.index);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn error_stats_require_fallback() {
        let dir = TempDir::new().unwrap();
        let session = dir.path().join("testsess");
        std::fs::create_dir_all(&session).unwrap();
        let img = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        img.save(session.join("frame_000000.png")).unwrap();
        let stats = FrameStats {
            filter_applied: "error".into(),
            error: Some("boom".into()),
            ..Default::default()
        };
        std::fs::write(
            session.join("frame_000000.json"),
            serde_json::to_vec(&stats).unwrap(),
        )
        .unwrap();

        let result = collector_for(&dir).wait_one(0).await;
        assert!(result.needs_fallback());
        // The frame itself is still present (worker wrote the original).
        assert!(result.frame.is_some());
    }
}
