//! Read-only preview HTTP surface.
//!
//! Serves the dashboard's view of live sessions from the state store and
//! the artifact directory. This surface never writes session state and
//! never modifies artifacts; the only thing it puts on disk is the cached
//! preview GIF.
//!
//! All handlers are thin - they delegate to the state reader or the GIF
//! builder.

mod gif;

pub use gif::evenly_spaced_indices;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::artifacts;
use crate::constants::{SERVICE_ID, SSE_POLL_INTERVAL};
use crate::error::{FramecastError, FramecastResult};
use crate::state_store::StateReader;

/// Shared state for the preview router.
#[derive(Clone)]
pub struct PreviewState {
    pub reader: StateReader,
    /// Root of per-session artifact directories.
    pub artifact_root: PathBuf,
    /// Directory for cached preview GIFs.
    pub gif_dir: PathBuf,
    /// Single-flight locks so concurrent requests build one GIF once.
    gif_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PreviewState {
    pub fn new(reader: StateReader, artifact_root: PathBuf, gif_dir: PathBuf) -> Self {
        Self {
            reader,
            artifact_root,
            gif_dir,
            gif_locks: Arc::new(DashMap::new()),
        }
    }
}

/// Creates the Axum router with all preview routes.
pub fn create_router(state: PreviewState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/session/{id}/status", get(session_status))
        .route("/session/{id}/stream", get(session_stream))
        .route("/session/{id}/preview.gif", get(preview_gif))
        .route("/session/{id}/frame/{n}", get(session_frame))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves the preview surface until the task is dropped.
pub async fn start_preview_server(state: PreviewState, port: u16) -> FramecastResult<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FramecastError::Configuration(format!("preview bind {}: {}", addr, e)))?;
    log::info!("[Preview] Listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| FramecastError::Internal(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /sessions - summaries of every known session, newest first.
async fn list_sessions(State(state): State<PreviewState>) -> impl IntoResponse {
    let mut sessions = Vec::new();
    for id in state.reader.list_session_ids().await {
        if let Some(summary) = state.reader.session_summary(&id).await {
            sessions.push(summary);
        }
    }
    Json(sessions)
}

/// GET /session/{id}/status - one session's summary.
async fn session_status(
    Path(id): Path<String>,
    State(state): State<PreviewState>,
) -> Response {
    match state.reader.session_summary(&id).await {
        Some(summary) => Json(summary).into_response(),
        None => FramecastError::SessionNotFound(id).into_response(),
    }
}

/// GET /session/{id}/stream - Server-Sent Events status feed.
///
/// Emits the summary every 500 ms; the event after a terminal status is the
/// last one, then the stream ends.
async fn session_stream(
    Path(id): Path<String>,
    State(state): State<PreviewState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            let (event, done) = match state.reader.session_summary(&id).await {
                Some(summary) => {
                    let done = summary.status == "completed" || summary.status == "failed";
                    let data = serde_json::to_string(&summary)
                        .unwrap_or_else(|_| "{}".to_string());
                    (Event::default().data(data), done)
                }
                None => (
                    Event::default().data(format!("{{\"error\":\"unknown session {}\"}}", id)),
                    true,
                ),
            };
            yield Ok(event);
            if done {
                break;
            }
            tokio::time::sleep(SSE_POLL_INTERVAL).await;
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /session/{id}/preview.gif - lazily built, disk-cached animation.
async fn preview_gif(Path(id): Path<String>, State(state): State<PreviewState>) -> Response {
    let gif_path = state.gif_dir.join(format!("{}.gif", id));

    // Serve the cache when present; single-flight the build otherwise.
    if !tokio::fs::try_exists(&gif_path).await.unwrap_or(false) {
        let lock = state
            .gif_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A racing request may have finished the build while we waited.
        if !tokio::fs::try_exists(&gif_path).await.unwrap_or(false) {
            let session_dir = artifacts::session_dir(&state.artifact_root, &id);
            let out = gif_path.clone();
            let built = tokio::task::spawn_blocking(move || {
                gif::build_preview_gif(&session_dir, &out)
            })
            .await;
            match built {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return e.into_response(),
                Err(e) => return FramecastError::Internal(e.to_string()).into_response(),
            }
        }
    }

    match tokio::fs::read(&gif_path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/gif")],
            bytes,
        )
            .into_response(),
        Err(_) => FramecastError::SessionNotFound(id).into_response(),
    }
}

/// GET /session/{id}/frame/{n} - one artifact PNG.
async fn session_frame(
    Path((id, n)): Path<(String, u64)>,
    State(state): State<PreviewState>,
) -> Response {
    let path = artifacts::frame_png_path(&state.artifact_root, &id, n);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            bytes,
        )
            .into_response(),
        Err(_) => FramecastError::FrameNotFound {
            session: id,
            index: n as usize,
        }
        .into_response(),
    }
}

