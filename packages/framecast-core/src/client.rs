//! Protocol client: sends a video for processing and receives the result.
//!
//! Mirror of the orchestrator's wire side: handshake, stream the file,
//! half-close, then iterate incoming messages until the terminal variant.
//! Rendering (progress bars, summaries) belongs to the binary; this module
//! only surfaces events through a callback.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::constants::{PROTOCOL_VERSION, STREAM_CHUNK_SIZE};
use crate::error::{FramecastError, FramecastResult};
use crate::protocol::{recv_bytes, recv_message, send_message, Message, VideoInfo};

/// Address family selection for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPreference {
    #[default]
    Auto,
    ForceV4,
    ForceV6,
}

impl FamilyPreference {
    fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Auto => true,
            Self::ForceV4 => addr.is_ipv4(),
            Self::ForceV6 => addr.is_ipv6(),
        }
    }
}

/// Client-side transfer parameters.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub host: String,
    pub port: u16,
    pub family: FamilyPreference,
    pub video: PathBuf,
    pub output: PathBuf,
    pub processing: String,
    pub codec: String,
    pub filters: Vec<Value>,
}

/// Progress as reported by the server.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub frames_processed: u64,
    pub frames_total: u64,
    pub fps: f64,
    pub eta_seconds: f64,
}

/// How a transfer ended.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Output video written to `output`.
    Completed {
        session_id: String,
        output: PathBuf,
        size_bytes: u64,
        metrics: Value,
    },
    /// Server reported a processing failure.
    Failed { code: String, message: String },
}

/// Resolves the target, honoring a forced family.
async fn resolve_target(
    host: &str,
    port: u16,
    family: FamilyPreference,
) -> FramecastResult<SocketAddr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FramecastError::Transport(format!("resolve {}: {}", host, e)))?;

    addrs.into_iter().find(|a| family.admits(a)).ok_or_else(|| {
        FramecastError::Transport(format!(
            "{} has no address for the requested family",
            host
        ))
    })
}

/// Runs one full transfer.
///
/// `on_progress` fires for every `progress` message; the terminal `result`
/// or `error` message ends the loop.
pub async fn send_video<F>(
    request: &TransferRequest,
    mut on_progress: F,
) -> FramecastResult<TransferOutcome>
where
    F: FnMut(&ProgressUpdate),
{
    let video_size = tokio::fs::metadata(&request.video)
        .await
        .map_err(|e| {
            FramecastError::Configuration(format!("video '{}': {}", request.video.display(), e))
        })?
        .len();
    let video_name = request
        .video
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".into());

    let addr = resolve_target(&request.host, request.port, request.family).await?;
    let family = if addr.is_ipv6() { "IPv6" } else { "IPv4" };
    log::info!("[Client] Connecting to {} ({})", addr, family);

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| FramecastError::Transport(format!("connect {}: {}", addr, e)))?;
    let (mut rd, mut wr) = stream.into_split();

    let handshake = Message::Handshake {
        version: PROTOCOL_VERSION,
        mode: "stream".into(),
        codec: request.codec.clone(),
        processing: request.processing.clone(),
        filters: request.filters.clone(),
        video_info: VideoInfo {
            filename: video_name,
            size_bytes: video_size,
        },
    };
    send_message(&mut wr, &handshake).await?;

    let session_id = match recv_message(&mut rd).await? {
        Some(Message::HandshakeAck {
            accepted: true,
            session_id,
            preview_url,
        }) => {
            if let Some(url) = preview_url {
                log::info!("[Client] Preview available at {}", url);
            }
            session_id
        }
        Some(Message::HandshakeAck { accepted: false, .. }) => {
            return Err(FramecastError::Handshake("server rejected the session".into()))
        }
        Some(Message::Error { code, message, .. }) => {
            return Ok(TransferOutcome::Failed { code, message })
        }
        other => {
            return Err(FramecastError::Decode(format!(
                "expected handshake_ack, got {:?}",
                other.map(|m| m.kind())
            )))
        }
    };
    log::info!("[Client] Session {} started", session_id);

    stream_file(&request.video, &mut wr).await?;
    // Half-close tells the server the upload is complete.
    wr.shutdown()
        .await
        .map_err(|e| FramecastError::Transport(format!("shutdown write side: {}", e)))?;

    loop {
        let message = recv_message(&mut rd).await?.ok_or_else(|| {
            FramecastError::Transport("connection closed before a result arrived".into())
        })?;

        match message {
            Message::Progress {
                frames_processed,
                frames_total,
                fps,
                eta_seconds,
            } => {
                on_progress(&ProgressUpdate {
                    frames_processed,
                    frames_total,
                    fps,
                    eta_seconds,
                });
            }
            Message::Result {
                ok,
                size_bytes,
                metrics,
                ..
            } => {
                if !ok {
                    return Ok(TransferOutcome::Failed {
                        code: "PROCESSING_ERROR".into(),
                        message: "server reported failure".into(),
                    });
                }
                let video = recv_bytes(&mut rd, size_bytes as usize).await?;
                if let Some(parent) = request.output.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| FramecastError::Transport(e.to_string()))?;
                    }
                }
                tokio::fs::write(&request.output, &video)
                    .await
                    .map_err(|e| {
                        FramecastError::Transport(format!(
                            "write '{}': {}",
                            request.output.display(),
                            e
                        ))
                    })?;
                return Ok(TransferOutcome::Completed {
                    session_id,
                    output: request.output.clone(),
                    size_bytes,
                    metrics,
                });
            }
            Message::Error { code, message, .. } => {
                return Ok(TransferOutcome::Failed { code, message });
            }
            other => {
                log::warn!("[Client] Ignoring unexpected '{}' message", other.kind());
            }
        }
    }
}

/// Streams the video file in chunks, flushing between writes so a slow
/// server backpressures the read side instead of ballooning memory.
async fn stream_file<W>(path: &Path, writer: &mut W) -> FramecastResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FramecastError::Configuration(format!("open '{}': {}", path.display(), e)))?;

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| FramecastError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| FramecastError::Transport(format!("send video: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| FramecastError::Transport(e.to_string()))?;
        sent += n as u64;
    }
    log::info!("[Client] Video sent ({} bytes)", sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_preference_filters_addresses() {
        let v4: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let v6: SocketAddr = "[::1]:9090".parse().unwrap();

        assert!(FamilyPreference::Auto.admits(&v4));
        assert!(FamilyPreference::Auto.admits(&v6));
        assert!(FamilyPreference::ForceV4.admits(&v4));
        assert!(!FamilyPreference::ForceV4.admits(&v6));
        assert!(FamilyPreference::ForceV6.admits(&v6));
        assert!(!FamilyPreference::ForceV6.admits(&v4));
    }

    #[tokio::test]
    async fn resolve_honors_forced_family() {
        let addr = resolve_target("127.0.0.1", 9090, FamilyPreference::ForceV4)
            .await
            .unwrap();
        assert!(addr.is_ipv4());

        let err = resolve_target("127.0.0.1", 9090, FamilyPreference::ForceV6).await;
        assert!(err.is_err());
    }
}
