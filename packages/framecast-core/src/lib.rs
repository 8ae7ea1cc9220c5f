//! Framecast Core - shared library for the Framecast video processing
//! service.
//!
//! One front-end server accepts a video over a length-prefixed TCP protocol,
//! decodes it into frames, fans the frames out to a pool of workers over a
//! Redis queue, reassembles the processed frames back into a video in
//! original order, streams progress to the client, and publishes live
//! session state for a read-only preview dashboard.
//!
//! # Architecture
//!
//! - [`protocol`]: length-prefixed JSON wire protocol and message sum type
//! - [`listener`]: dual-stack TCP listener (IPv4 + IPv6 on one port)
//! - [`session`]: per-connection orchestrator state machine
//! - [`media`]: ffmpeg-backed video decode and encode (blocking pool only)
//! - [`dispatch`]: frame units of work onto the Redis queue
//! - [`collect`]: artifact-directory polling and ordered result delivery
//! - [`assemble`]: out-of-order frame buffer draining in index order
//! - [`metrics`]: per-session counters, latency percentiles, progress
//! - [`state_store`]: TTL'd session state in Redis, single writer per session
//! - [`preview`]: read-only HTTP surface (status JSON, SSE, GIF, frames)
//! - [`worker`]: queue consumer applying filters and writing artifacts
//! - [`client`]: wire-side mirror of the orchestrator for the CLI
//! - [`context`]: runtime context replacing global singletons
//! - [`error`]: centralized error types
//!
//! The network-facing pieces are cooperative tasks on the tokio runtime;
//! video decode/encode, large file I/O, and GIF building always run on the
//! blocking pool.

#![warn(clippy::all)]

pub mod artifacts;
pub mod assemble;
pub mod client;
pub mod collect;
pub mod constants;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod media;
pub mod metrics;
pub mod preview;
pub mod protocol;
pub mod session;
pub mod state_store;
pub mod utils;
pub mod worker;

// Re-export commonly used types at the crate root
pub use client::{send_video, FamilyPreference, ProgressUpdate, TransferOutcome, TransferRequest};
pub use context::{RuntimeContext, SessionTimeouts, DEFAULT_REDIS_URL};
pub use error::{FramecastError, FramecastResult};
pub use listener::VideoListener;
pub use media::{Frame, VideoProperties};
pub use metrics::MetricsCollector;
pub use preview::{create_router, start_preview_server, PreviewState};
pub use protocol::Message;
pub use session::{handle_connection, ProcessingKind, Session, SessionStatus};
pub use state_store::{SessionSummary, StatePublisher, StateReader};
pub use worker::{run_worker, WorkerConfig};
