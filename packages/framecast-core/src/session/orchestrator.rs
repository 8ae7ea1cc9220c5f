//! Per-connection session orchestration.
//!
//! One orchestrator owns one session end to end:
//!
//! ```text
//! accept → handshaking → receiving → dispatching → awaiting → encoding → completed
//!                                                                   ↘ failed
//! ```
//!
//! The event-loop task never performs blocking work directly. Video decode,
//! PNG encode, and file reads run on the blocking pool; the output encoder
//! runs on one dedicated blocking task fed through a bounded channel, which
//! is also what backpressures collection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::assemble::{FrameBuffer, FrameSink};
use crate::collect::{FrameCollector, FrameResult};
use crate::constants::{
    ASSEMBLY_QUEUE_DEPTH, COLLECT_BATCH_SIZE, COLLECT_CONCURRENCY, PROGRESS_FRAME_INTERVAL,
    PROGRESS_TIME_INTERVAL, STREAM_CHUNK_SIZE,
};
use crate::context::RuntimeContext;
use crate::dispatch::WorkUnit;
use crate::error::{FramecastError, FramecastResult};
use crate::media::{self, Frame, VideoProperties};
use crate::metrics::MetricsCollector;
use crate::protocol::{recv_message, send_bytes, send_message, Message};
use crate::session::{ProcessingKind, Session, SessionStatus};
use crate::utils::new_session_id;

/// Entry point spawned by the listener for each accepted connection.
pub async fn handle_connection(ctx: RuntimeContext, stream: TcpStream, peer: SocketAddr) {
    let (rd, wr) = stream.into_split();
    let mut orchestrator = Orchestrator {
        ctx,
        rd,
        wr,
        peer,
        session: None,
        metrics: Arc::new(MetricsCollector::new()),
    };

    match orchestrator.run().await {
        Ok(()) => {
            if let Some(session) = &orchestrator.session {
                log::info!("[Session] [{}] Completed", session.id);
            }
        }
        Err(e) => orchestrator.fail(e).await,
    }
}

/// Metadata travelling with each frame into the assembly sink, where the
/// final success/failure verdict (including encoder write errors) lands in
/// the metrics.
struct FrameMeta {
    processing_ms: f64,
    worker_host: Option<String>,
    filter: Option<String>,
    memory_mb: f64,
    failed: bool,
}

enum AssemblyCommand {
    Frame { index: u64, frame: Frame },
    Finalize { total: u64 },
}

struct AssemblyReport {
    frames_written: u64,
    write_failures: u64,
}

struct Orchestrator {
    ctx: RuntimeContext,
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    peer: SocketAddr,
    session: Option<Session>,
    metrics: Arc<MetricsCollector>,
}

impl Orchestrator {
    async fn run(&mut self) -> FramecastResult<()> {
        self.handshake().await?;

        self.publish_status(SessionStatus::Receiving).await;
        let input_path = self.receive_video().await?;

        self.publish_status(SessionStatus::Dispatching).await;
        let (originals, props, failed_dispatch) = self.dispatch_frames(&input_path).await?;

        self.publish_status(SessionStatus::Awaiting).await;
        self.collect_and_encode(originals, props, failed_dispatch)
            .await?;

        self.complete(props).await
    }

    // ── handshaking ──────────────────────────────────────────────────────

    /// Reads and validates the opening handshake within the deadline.
    ///
    /// Nothing reaches the state store until the handshake is accepted, so
    /// a rejected connection leaves no externally visible session.
    async fn handshake(&mut self) -> FramecastResult<()> {
        let deadline = self.ctx.timeouts.handshake;
        let message = tokio::time::timeout(deadline, recv_message(&mut self.rd))
            .await
            .map_err(|_| FramecastError::Handshake(format!("no handshake within {:?}", deadline)))?
            .map_err(|e| FramecastError::Handshake(e.to_string()))?;

        let (codec, processing, filters, video_info) = match message {
            Some(Message::Handshake {
                codec,
                processing,
                filters,
                video_info,
                ..
            }) => (codec, processing, filters, video_info),
            Some(other) => {
                return Err(FramecastError::Handshake(format!(
                    "expected handshake, got '{}'",
                    other.kind()
                )))
            }
            None => {
                return Err(FramecastError::Handshake(
                    "connection closed before handshake".into(),
                ))
            }
        };

        let id = new_session_id();
        let session = Session {
            id: id.clone(),
            peer: self.peer,
            processing: ProcessingKind::parse(&processing),
            codec: if codec.is_empty() {
                self.ctx.codec.clone()
            } else {
                codec
            },
            filters,
            video_info,
            started: Instant::now(),
        };
        log::info!(
            "[Session] [{}] Client {} connected via {} (processing={})",
            session.id,
            session.peer,
            session.family(),
            session.processing.as_str()
        );

        self.ctx
            .state
            .publish_status(&session.id, SessionStatus::Handshaking)
            .await;
        self.ctx
            .state
            .publish(&session.id, "processing_type", session.processing.as_str())
            .await;
        self.ctx
            .state
            .publish(&session.id, "video_name", &session.video_info.filename)
            .await;

        let ack = Message::HandshakeAck {
            accepted: true,
            session_id: id.clone(),
            preview_url: self.ctx.preview_url(&id),
        };
        send_message(&mut self.wr, &ack).await?;

        self.session = Some(session);
        Ok(())
    }

    // ── receiving ────────────────────────────────────────────────────────

    /// Streams raw video bytes to the session input file until the client
    /// half-closes its write side. The declared size is advisory only.
    async fn receive_video(&mut self) -> FramecastResult<std::path::PathBuf> {
        let session = self.session_ref()?;
        let path = self.ctx.input_path(&session.id);
        let declared = session.video_info.size_bytes;
        let id = session.id.clone();

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| FramecastError::Transport(format!("open input file: {}", e)))?;

        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut received: u64 = 0;
        loop {
            let n = self
                .rd
                .read(&mut buf)
                .await
                .map_err(|e| FramecastError::Transport(format!("receive video: {}", e)))?;
            if n == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..n])
                .await
                .map_err(|e| FramecastError::Transport(format!("write input file: {}", e)))?;
            received += n as u64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| FramecastError::Transport(e.to_string()))?;

        if received == 0 {
            return Err(FramecastError::Transport(
                "client closed before sending any video bytes".into(),
            ));
        }
        if declared > 0 && received != declared {
            log::debug!(
                "[Session] [{}] Received {} bytes, handshake declared {}",
                id,
                received,
                declared
            );
        }
        log::info!("[Session] [{}] Video received ({} bytes)", id, received);
        Ok(path)
    }

    // ── dispatching ──────────────────────────────────────────────────────

    /// Decodes the input into frames and enqueues every frame as a unit of
    /// work. Returns the originals (kept for fallback), the derived video
    /// properties, and the set of indices whose dispatch failed.
    async fn dispatch_frames(
        &mut self,
        input_path: &std::path::Path,
    ) -> FramecastResult<(Arc<Vec<Frame>>, VideoProperties, HashSet<u64>)> {
        let session = self.session_ref()?;
        let id = session.id.clone();
        let processing = session.processing;
        let params = session.work_params();
        let video_name = session.video_info.filename.clone();

        let decode_path = input_path.to_path_buf();
        let (frames, props) = tokio::task::spawn_blocking(move || media::decode_frames(&decode_path))
            .await
            .map_err(|e| FramecastError::Internal(format!("decode task: {}", e)))??;

        self.metrics.set_total_frames(props.total_frames);
        self.ctx
            .state
            .publish_session_start(
                &id,
                props.total_frames,
                props.fps,
                &props.resolution(),
                processing.as_str(),
                &video_name,
            )
            .await;

        // Per-session artifact directory; stale leftovers from a recycled id
        // would corrupt collection.
        let session_dir = crate::artifacts::session_dir(&self.ctx.artifact_root, &id);
        if tokio::fs::try_exists(&session_dir).await.unwrap_or(false) {
            let _ = tokio::fs::remove_dir_all(&session_dir).await;
        }
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| FramecastError::Internal(format!("artifact dir: {}", e)))?;

        let mut failed_dispatch = HashSet::new();
        for (index, frame) in frames.iter().enumerate() {
            let index = index as u64;
            let frame = frame.clone();
            let png = tokio::task::spawn_blocking(move || frame.to_png())
                .await
                .map_err(|e| FramecastError::Internal(format!("png task: {}", e)))?;

            let png = match png {
                Ok(png) => png,
                Err(e) => {
                    log::error!("[Session] [{}] PNG encode of frame {} failed: {}", id, index, e);
                    failed_dispatch.insert(index);
                    continue;
                }
            };

            let unit = WorkUnit::new(&id, index, &png, processing.as_str(), params.clone());
            if let Err(e) = self.ctx.dispatcher.dispatch(&unit).await {
                log::error!("[Session] [{}] {}", id, e);
                failed_dispatch.insert(index);
            }
        }

        if failed_dispatch.len() as u64 == props.total_frames {
            return Err(FramecastError::Dispatch {
                index: 0,
                reason: "broker rejected every frame".into(),
            });
        }

        log::info!(
            "[Session] [{}] Dispatched {} frames ({} failed)",
            id,
            props.total_frames - failed_dispatch.len() as u64,
            failed_dispatch.len()
        );
        Ok((Arc::new(frames), props, failed_dispatch))
    }

    // ── awaiting / encoding ──────────────────────────────────────────────

    /// Drives collection in batches, feeding each ordered result into the
    /// assembly sink and reporting progress to client and state store.
    async fn collect_and_encode(
        &mut self,
        originals: Arc<Vec<Frame>>,
        props: VideoProperties,
        failed_dispatch: HashSet<u64>,
    ) -> FramecastResult<()> {
        let session = self.session_ref()?;
        let id = session.id.clone();
        let output_path = self.ctx.output_path(&id);
        let codec = session.codec.clone();

        let meta_map: Arc<Mutex<HashMap<u64, FrameMeta>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<AssemblyCommand>(ASSEMBLY_QUEUE_DEPTH);

        let assembly = tokio::task::spawn_blocking({
            let meta_map = Arc::clone(&meta_map);
            let metrics = Arc::clone(&self.metrics);
            let output_path = output_path.clone();
            move || run_assembly(rx, output_path, codec, props, meta_map, metrics)
        });

        let collector = FrameCollector::new(self.ctx.artifact_root.clone(), &id).with_timing(
            crate::constants::COLLECT_POLL_INTERVAL,
            self.ctx.timeouts.frame_collect,
        );

        let mut ticker = ProgressTicker::new();
        let total = props.total_frames;
        let batch = COLLECT_BATCH_SIZE as u64;
        let mut start = 0u64;

        while start < total {
            let end = (start + batch).min(total);
            let waitable: Vec<u64> = (start..end)
                .filter(|i| !failed_dispatch.contains(i))
                .collect();

            let mut results = collector.collect_all(waitable, COLLECT_CONCURRENCY).await;
            for &index in failed_dispatch.iter() {
                if index >= start && index < end {
                    results.push(FrameResult {
                        index,
                        frame: None,
                        stats: None,
                    });
                }
            }
            results.sort_by_key(|r| r.index);

            for result in results {
                self.feed_assembly(result, &originals, props, &meta_map, &tx)
                    .await?;

                if ticker.should_tick(self.metrics.frames_processed()) {
                    self.report_progress(&id).await?;
                }
            }
            start = end;
        }

        self.publish_status(SessionStatus::Encoding).await;
        tx.send(AssemblyCommand::Finalize { total })
            .await
            .map_err(|_| FramecastError::MediaEncode("assembly thread gone".into()))?;
        drop(tx);

        let report = assembly
            .await
            .map_err(|e| FramecastError::Internal(format!("assembly task: {}", e)))??;
        if report.write_failures > 0 {
            log::warn!(
                "[Session] [{}] {} frames failed to encode (substituted in place)",
                id,
                report.write_failures
            );
        }
        log::info!(
            "[Session] [{}] Encoder wrote {} frames",
            id,
            report.frames_written
        );

        // Final progress so the client sees 100% before the result message.
        self.report_progress(&id).await?;
        Ok(())
    }

    /// Resolves one collection result to the frame that enters the output
    /// video, falling back to the original on timeout or worker failure.
    async fn feed_assembly(
        &mut self,
        result: FrameResult,
        originals: &Arc<Vec<Frame>>,
        props: VideoProperties,
        meta_map: &Arc<Mutex<HashMap<u64, FrameMeta>>>,
        tx: &mpsc::Sender<AssemblyCommand>,
    ) -> FramecastResult<()> {
        let index = result.index;
        let fallback = result.needs_fallback();

        let stats = result.stats;
        if let Some(stats) = &stats {
            for _ in 0..stats.retries {
                self.metrics.record_retry();
            }
        }

        let frame = if fallback {
            originals
                .get(index as usize)
                .cloned()
                .unwrap_or_else(|| Frame::zero(props.width, props.height))
        } else {
            // needs_fallback() guarantees the frame is present here.
            result.frame.expect("collected frame missing")
        };

        let meta = FrameMeta {
            processing_ms: stats.as_ref().map(|s| s.processing_time_ms).unwrap_or(0.0),
            worker_host: stats.as_ref().map(|s| s.hostname.clone()),
            filter: if fallback {
                Some("fallback".to_string())
            } else {
                stats.as_ref().map(|s| s.filter_applied.clone())
            },
            memory_mb: stats.as_ref().map(|s| s.memory_mb).unwrap_or(0.0),
            failed: fallback,
        };
        meta_map.lock().insert(index, meta);

        tx.send(AssemblyCommand::Frame { index, frame })
            .await
            .map_err(|_| FramecastError::MediaEncode("assembly thread gone".into()))
    }

    /// Sends `progress` to the client and mirrors it to the state store.
    async fn report_progress(&mut self, session_id: &str) -> FramecastResult<()> {
        let snapshot = self.metrics.progress();
        send_message(
            &mut self.wr,
            &Message::Progress {
                frames_processed: snapshot.frames_processed,
                frames_total: snapshot.frames_total,
                fps: snapshot.fps,
                eta_seconds: snapshot.eta_seconds,
            },
        )
        .await?;
        self.ctx
            .state
            .publish_progress(
                session_id,
                snapshot.frames_processed,
                snapshot.fps,
                snapshot.eta_seconds,
            )
            .await;
        Ok(())
    }

    // ── completed ────────────────────────────────────────────────────────

    /// Publishes the terminal record and delivers the encoded video.
    async fn complete(&mut self, props: VideoProperties) -> FramecastResult<()> {
        let session = self.session_ref()?;
        let id = session.id.clone();
        let elapsed = session.started.elapsed().as_secs_f64();
        let output_path = self.ctx.output_path(&id);

        self.ctx
            .state
            .publish_end(&id, SessionStatus::Completed, elapsed)
            .await;

        let video = tokio::fs::read(&output_path)
            .await
            .map_err(|e| FramecastError::MediaEncode(format!("read output: {}", e)))?;

        let result = Message::Result {
            ok: true,
            output_path: output_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes: video.len() as u64,
            metrics: self.metrics.summary(),
        };
        send_message(&mut self.wr, &result).await?;
        send_bytes(&mut self.wr, &video).await?;

        log::info!(
            "[Session] [{}] Delivered {} bytes ({} frames, {:.1}s)",
            id,
            video.len(),
            props.total_frames,
            elapsed
        );
        Ok(())
    }

    // ── failure path ─────────────────────────────────────────────────────

    /// Terminal error handling: best-effort error reply, failed status in
    /// the state store, and local resource cleanup.
    async fn fail(&mut self, err: FramecastError) {
        match &self.session {
            Some(session) => {
                log::error!("[Session] [{}] Failed: {}", session.id, err)
            }
            None => log::warn!("[Session] Connection from {} rejected: {}", self.peer, err),
        }

        // The stream may already be dead; a failed send here is expected.
        let error_msg = Message::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            recoverable: false,
        };
        if let Err(e) = send_message(&mut self.wr, &error_msg).await {
            log::debug!("[Session] Error reply not delivered: {}", e);
        }

        if let Some(session) = &self.session {
            let id = session.id.clone();
            let elapsed = session.started.elapsed().as_secs_f64();
            self.ctx
                .state
                .publish_end(&id, SessionStatus::Failed, elapsed)
                .await;

            // Remove session files; the artifact directory stays for the
            // preview surface and expires with the state keys.
            let _ = tokio::fs::remove_file(self.ctx.input_path(&id)).await;
            let _ = tokio::fs::remove_file(self.ctx.output_path(&id)).await;
        }
    }

    async fn publish_status(&self, status: SessionStatus) {
        if let Some(session) = &self.session {
            self.ctx.state.publish_status(&session.id, status).await;
        }
    }

    fn session_ref(&self) -> FramecastResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| FramecastError::Internal("session not established".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assembly (blocking side)
// ─────────────────────────────────────────────────────────────────────────────

/// Sink that writes to the video encoder and settles each frame's metrics.
///
/// The reassembly buffer guarantees writes arrive in index order starting at
/// zero, so the sink's own counter identifies the frame being written; an
/// encoder write failure flips that frame to failed without stalling the
/// cursor.
struct EncoderSink {
    encoder: media::VideoEncoder,
    meta_map: Arc<Mutex<HashMap<u64, FrameMeta>>>,
    metrics: Arc<MetricsCollector>,
    next_index: u64,
}

impl FrameSink for EncoderSink {
    fn write(&mut self, frame: &Frame) -> FramecastResult<()> {
        let index = self.next_index;
        self.next_index += 1;

        let write_result = self.encoder.write_frame(frame);
        let meta = self.meta_map.lock().remove(&index);

        match meta {
            Some(meta) => self.metrics.record_frame(
                meta.processing_ms,
                meta.worker_host.as_deref(),
                meta.filter.as_deref(),
                meta.memory_mb,
                meta.failed || write_result.is_err(),
            ),
            // Synthesized gap frame: nothing collected for this index.
            None => self.metrics.record_frame(0.0, None, None, 0.0, true),
        }

        write_result
    }
}

/// Body of the dedicated assembly task. Owns the encoder for its lifetime.
fn run_assembly(
    mut rx: mpsc::Receiver<AssemblyCommand>,
    output_path: std::path::PathBuf,
    codec: String,
    props: VideoProperties,
    meta_map: Arc<Mutex<HashMap<u64, FrameMeta>>>,
    metrics: Arc<MetricsCollector>,
) -> FramecastResult<AssemblyReport> {
    let encoder = media::VideoEncoder::open(
        &output_path,
        &codec,
        props.fps,
        props.width,
        props.height,
    )?;
    let sink = EncoderSink {
        encoder,
        meta_map,
        metrics,
        next_index: 0,
    };
    let buffer = FrameBuffer::new(sink, props.width, props.height);

    while let Some(command) = rx.blocking_recv() {
        match command {
            AssemblyCommand::Frame { index, frame } => {
                buffer.add(index, frame);
            }
            AssemblyCommand::Finalize { total } => {
                buffer.flush_remaining(total);
                break;
            }
        }
    }

    let write_failures = buffer.write_failures();
    let mut sink = buffer.into_sink();
    let frames_written = sink.encoder.finish()?;

    Ok(AssemblyReport {
        frames_written,
        write_failures,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress cadence
// ─────────────────────────────────────────────────────────────────────────────

/// Every Nth completed frame or every T elapsed, whichever comes first.
struct ProgressTicker {
    last_count: u64,
    last_at: tokio::time::Instant,
}

impl ProgressTicker {
    fn new() -> Self {
        Self {
            last_count: 0,
            last_at: tokio::time::Instant::now(),
        }
    }

    fn should_tick(&mut self, count: u64) -> bool {
        let due = count >= self.last_count + PROGRESS_FRAME_INTERVAL as u64
            || self.last_at.elapsed() >= PROGRESS_TIME_INTERVAL;
        if due {
            self.last_count = count;
            self.last_at = tokio::time::Instant::now();
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_fires_on_frame_interval() {
        let mut ticker = ProgressTicker::new();
        assert!(!ticker.should_tick(1));
        assert!(!ticker.should_tick(29));
        assert!(ticker.should_tick(30));
        // Interval resets from the last tick.
        assert!(!ticker.should_tick(31));
        assert!(ticker.should_tick(60));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_elapsed_time() {
        let mut ticker = ProgressTicker::new();
        assert!(!ticker.should_tick(1));
        tokio::time::advance(PROGRESS_TIME_INTERVAL + std::time::Duration::from_millis(1)).await;
        assert!(ticker.should_tick(2));
    }
}
