//! Framecast Server - distributed video processing front-end.
//!
//! Accepts videos from clients over a dual-stack TCP protocol, fans frames
//! out to workers through the broker, reassembles the processed result, and
//! serves a read-only preview surface for the dashboard.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use framecast_core::{start_preview_server, PreviewState, RuntimeContext, VideoListener};

use crate::config::ServerConfig;

/// Framecast Server - video processing over dual-stack TCP.
#[derive(Parser, Debug)]
#[command(name = "framecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FRAMECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind address (overrides config file).
    #[arg(short, long)]
    bind: Option<String>,

    /// Video protocol port (overrides config file).
    #[arg(short = 'p', long, env = "FRAMECAST_PORT")]
    port: Option<u16>,

    /// Output codec (overrides config file).
    #[arg(long)]
    codec: Option<String>,

    /// Preview HTTP port (overrides config file).
    #[arg(long, env = "FRAMECAST_PREVIEW_PORT")]
    preview_port: Option<u16>,

    /// Data directory for session artifacts and videos.
    #[arg(short = 'd', long, env = "FRAMECAST_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Framecast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(codec) = args.codec {
        config.codec = codec;
    }
    if let Some(port) = args.preview_port {
        config.preview_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    log::info!(
        "Configuration: bind={}:{}, codec={}, preview_port={}, data_dir={}",
        config.bind,
        config.port,
        config.codec,
        config.preview_port,
        config.data_dir.display()
    );

    let ctx = RuntimeContext::connect(
        &config.redis_url,
        &config.data_dir,
        &config.codec,
        config.preview_port,
    )
    .await
    .context("Failed to connect to broker/state store")?;

    // Preview surface runs alongside the protocol listener.
    let preview_state = PreviewState::new(
        ctx.state_reader.clone(),
        ctx.artifact_root.clone(),
        ctx.work_root.join("gifs"),
    );
    let preview_port = config.preview_port;
    let preview_handle = tokio::spawn(async move {
        if let Err(e) = start_preview_server(preview_state, preview_port).await {
            log::error!("Preview server error: {}", e);
        }
    });

    let listener = VideoListener::bind(&config.bind, config.port)
        .context("Failed to bind protocol listener")?;

    let shutdown = CancellationToken::new();
    let serve_handle = {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { listener.serve(ctx, shutdown).await })
    };

    shutdown_signal().await;
    log::info!("Shutdown signal received, draining sessions...");

    shutdown.cancel();
    let _ = serve_handle.await;
    preview_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
