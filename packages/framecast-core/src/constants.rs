//! Fixed protocol and pipeline constants.
//!
//! These values are part of the wire protocol or the worker contract;
//! changing them breaks compatibility with deployed clients and workers.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of one JSON protocol frame (100 MiB).
///
/// Metrics summaries and handshakes are tiny; the bound exists to reject
/// garbage length prefixes before allocating.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Chunk size for streaming raw video bytes over the socket.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Session Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Deadline for the client to deliver its handshake after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-frame deadline for worker artifacts to appear on disk.
pub const FRAME_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between artifact-directory polls while waiting on one frame.
pub const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parallelism of the artifact poller within one session.
pub const COLLECT_CONCURRENCY: usize = 8;

/// Batch size for streaming collection (bounds encoder-side buffering).
pub const COLLECT_BATCH_SIZE: usize = 50;

/// Progress is reported every this many completed frames...
pub const PROGRESS_FRAME_INTERVAL: usize = 30;

/// ...or after this much time since the last report, whichever first.
pub const PROGRESS_TIME_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the bounded channel feeding the blocking encoder thread.
pub const ASSEMBLY_QUEUE_DEPTH: usize = 32;

/// Window allowed for in-flight sessions to finish after a shutdown signal.
pub const DRAIN_WINDOW: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Broker / Worker Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Redis list the dispatcher pushes frame work onto and workers drain.
pub const FRAME_QUEUE: &str = "frames";

/// Dispatch retry delays (same ladder as transient-error retries elsewhere).
pub const DISPATCH_RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Retries a worker may spend on one frame after the initial attempt.
pub const WORKER_MAX_RETRIES: u32 = 3;

/// Fixed delay between worker retry attempts.
pub const WORKER_RETRY_DELAY: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// State Store
// ─────────────────────────────────────────────────────────────────────────────

/// TTL applied to every session state key, refreshed on each write.
pub const SESSION_STATE_TTL_SECS: u64 = 3600;

// ─────────────────────────────────────────────────────────────────────────────
// Preview Surface
// ─────────────────────────────────────────────────────────────────────────────

/// Cadence of the SSE status feed.
pub const SSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum frames sampled into a preview GIF.
pub const PREVIEW_GIF_MAX_FRAMES: usize = 30;

/// Preview GIF frames are downscaled to at most this width.
pub const PREVIEW_GIF_MAX_WIDTH: u32 = 320;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the preview `/health` endpoint.
pub const SERVICE_ID: &str = "framecast";
