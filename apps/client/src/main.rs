//! Framecast Client - sends a video to the processing server and saves the
//! result.
//!
//! Exit codes: 0 on success, 1 on processing failure or user cancel.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use framecast_core::{send_video, FamilyPreference, TransferOutcome, TransferRequest};

/// Processing kinds the server understands.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Processing {
    Blur,
    Faces,
    Edges,
    Motion,
    Custom,
}

impl Processing {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Blur => "blur",
            Self::Faces => "faces",
            Self::Edges => "edges",
            Self::Motion => "motion",
            Self::Custom => "custom",
        }
    }
}

/// Framecast Client - send a video for distributed processing.
#[derive(Parser, Debug)]
#[command(name = "framecast-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address.
    #[arg(long, default_value = "::1")]
    host: String,

    /// Server port.
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// Force IPv4.
    #[arg(long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Force IPv6.
    #[arg(long, conflicts_with = "ipv4")]
    ipv6: bool,

    /// Path to the input video.
    #[arg(long, required = true)]
    video: PathBuf,

    /// Processing to apply.
    #[arg(long, value_enum, default_value_t = Processing::Blur)]
    processing: Processing,

    /// Output path for the processed video.
    #[arg(long, default_value = "output.mp4")]
    out: PathBuf,

    /// Output codec.
    #[arg(long, default_value = "mp4v")]
    codec: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "warn", env = "FRAMECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let family = if args.ipv4 {
        FamilyPreference::ForceV4
    } else if args.ipv6 {
        FamilyPreference::ForceV6
    } else {
        FamilyPreference::Auto
    };

    let request = TransferRequest {
        host: args.host,
        port: args.port,
        family,
        video: args.video,
        output: args.out,
        processing: args.processing.as_str().into(),
        codec: args.codec,
        filters: Vec::new(),
    };

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40} {percent:>3}% | {msg}",
        )
        .expect("static template"),
    );

    let outcome = send_video(&request, |update| {
        if bar.length() != Some(update.frames_total) {
            bar.set_length(update.frames_total);
        }
        bar.set_position(update.frames_processed);
        bar.set_message(format!(
            "{}/{} frames | {:.1} FPS | ETA: {:.1}s",
            update.frames_processed, update.frames_total, update.fps, update.eta_seconds
        ));
    })
    .await
    .context("Transfer failed")?;

    bar.finish_and_clear();

    match outcome {
        TransferOutcome::Completed {
            session_id,
            output,
            size_bytes,
            metrics,
        } => {
            println!("Session {} completed", session_id);
            println!(
                "Saved {} ({:.2} MB)",
                output.display(),
                size_bytes as f64 / 1024.0 / 1024.0
            );
            println!();
            println!("Metrics:");
            print_metric(&metrics, "frames_processed", "Frames processed");
            print_metric(&metrics, "frames_failed", "Frames failed");
            print_metric(&metrics, "fps_processing", "Processing FPS");
            print_metric(&metrics, "latency_p50_ms", "Latency p50 (ms)");
            print_metric(&metrics, "latency_p95_ms", "Latency p95 (ms)");
            print_metric(&metrics, "latency_p99_ms", "Latency p99 (ms)");
            print_metric(&metrics, "retries", "Retries");
            print_metric(&metrics, "worker_count", "Workers");
            Ok(true)
        }
        TransferOutcome::Failed { code, message } => {
            eprintln!("Server error [{}]: {}", code, message);
            Ok(false)
        }
    }
}

fn print_metric(metrics: &serde_json::Value, key: &str, label: &str) {
    if let Some(value) = metrics.get(key) {
        match value.as_f64() {
            Some(v) if v.fract() != 0.0 => println!("  {}: {:.2}", label, v),
            _ => println!("  {}: {}", label, value),
        }
    }
}
