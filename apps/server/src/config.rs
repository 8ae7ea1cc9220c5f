//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! CLI flags (handled in main.rs) win over both.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use framecast_core::DEFAULT_REDIS_URL;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the video protocol listener.
    /// `::` listens dual-stack on both families.
    pub bind: String,

    /// TCP port for the video protocol.
    /// Override: `FRAMECAST_PORT`
    pub port: u16,

    /// Output codec name passed to the encoder.
    /// Override: `FRAMECAST_CODEC`
    pub codec: String,

    /// HTTP port for the preview surface.
    /// Override: `FRAMECAST_PREVIEW_PORT`
    pub preview_port: u16,

    /// Broker and state-store URL.
    /// Override: `REDIS_URL`
    pub redis_url: String,

    /// Root directory for session artifacts, inputs, and outputs.
    /// Override: `FRAMECAST_DATA_DIR`
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "::".into(),
            port: 9090,
            codec: "mp4v".into(),
            preview_port: 8080,
            redis_url: DEFAULT_REDIS_URL.into(),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FRAMECAST_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }

        if let Ok(val) = std::env::var("FRAMECAST_PREVIEW_PORT") {
            if let Ok(port) = val.parse() {
                self.preview_port = port;
            }
        }

        if let Ok(val) = std::env::var("FRAMECAST_CODEC") {
            self.codec = val;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            self.redis_url = val;
        }

        // Note: FRAMECAST_DATA_DIR is handled by clap via #[arg(env = ...)]
        // in main.rs
    }
}
