//! Framecast Worker - drains frame work units from the broker queue,
//! applies filters, and writes artifact pairs for the server to collect.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use framecast_core::{run_worker, WorkerConfig, DEFAULT_REDIS_URL};

/// Framecast Worker - frame processing consumer.
#[derive(Parser, Debug)]
#[command(name = "framecast-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker queue to consume.
    #[arg(short, long, default_value = "frames")]
    queue: String,

    /// Data directory shared with the server (artifacts live under
    /// `<data-dir>/frames`).
    #[arg(short = 'd', long, default_value = "data", env = "FRAMECAST_DATA_DIR")]
    data_dir: PathBuf,

    /// Broker URL.
    #[arg(long, default_value = DEFAULT_REDIS_URL, env = "REDIS_URL")]
    redis_url: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "FRAMECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Framecast Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig {
        redis_url: args.redis_url,
        queue: args.queue,
        artifact_root: args.data_dir.join("frames"),
    };

    let shutdown = CancellationToken::new();
    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_worker(config, shutdown).await })
    };

    shutdown_signal().await;
    log::info!("Shutdown signal received");
    shutdown.cancel();

    worker
        .await
        .context("worker task panicked")?
        .context("worker failed")?;

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
