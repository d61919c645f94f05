//! Layered configuration: defaults, optional TOML file, environment.
//!
//! Every recognized option maps to a single effect. Environment variables
//! use the bare names from the operations docs (`MAX_SANDBOXES`,
//! `IDLE_TIMEOUT_MS`, ...) so deployments stay scriptable without a file.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One process: coordinator, runner, and pool in the same binary.
    Standalone,
    /// Control-plane replica routing work to registered runners.
    Coordinator,
}

/// Resolved configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Sandbox capacity cap.
    pub max_sandboxes: i64,
    /// waiting -> cold after this much idle time.
    pub idle_timeout_ms: u64,
    /// cold -> deleted after this much idle time.
    pub cold_cleanup_ttl_ms: u64,
    /// Runner considered dead after this long without a heartbeat.
    pub liveness_timeout_ms: u64,
    /// Runner heartbeat cadence.
    pub heartbeat_interval_ms: u64,
    /// Dead-client cutoff for SSE writes.
    pub sse_write_timeout_ms: u64,
    /// Cap on bridge startup (spawn to ready byte).
    pub bridge_ready_timeout_ms: u64,
    /// Object-store mirror for workspace snapshots (`s3://...`, `gs://...`,
    /// `file://...`). Unset disables the mirror.
    pub snapshot_url: Option<String>,
    /// Overrides the embedded file DB with an explicit sqlx URL.
    pub database_url: Option<String>,
    /// Process role.
    pub mode: Mode,
    /// Bearer token required on /internal/* and /runner/* when set.
    pub internal_secret: Option<String>,

    /// Root for the database, live workspaces, and local snapshots.
    pub data_dir: PathBuf,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Identity in the runner registry.
    pub runner_id: String,
    /// Host other nodes use to reach this one (defaults to `host`).
    pub advertise_host: Option<String>,
    /// Command line of the bridge child, whitespace separated.
    pub bridge_command: String,
    /// Base URL of the coordinator this runner registers with (runner mode).
    pub coordinator_url: Option<String>,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("max_sandboxes", 1000_i64)?
            .set_default("idle_timeout_ms", 30 * 60 * 1000_i64)?
            .set_default("cold_cleanup_ttl_ms", 2 * 60 * 60 * 1000_i64)?
            .set_default("liveness_timeout_ms", 30_000_i64)?
            .set_default("heartbeat_interval_ms", 10_000_i64)?
            .set_default("sse_write_timeout_ms", 30_000_i64)?
            .set_default("bridge_ready_timeout_ms", 10_000_i64)?
            .set_default("mode", "standalone")?
            .set_default("data_dir", "data")?
            .set_default("host", "127.0.0.1")?
            .set_default("port", 7410_i64)?
            .set_default("runner_id", "local")?
            .set_default("bridge_command", "ash-bridge")?;

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(Environment::default())
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        Ok(settings)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cold_cleanup_ttl(&self) -> Duration {
        Duration::from_millis(self.cold_cleanup_ttl_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sse_write_timeout(&self) -> Duration {
        Duration::from_millis(self.sse_write_timeout_ms)
    }

    pub fn bridge_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_ready_timeout_ms)
    }

    /// Path of the embedded database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ash.db")
    }

    /// Bridge command split into argv.
    pub fn bridge_argv(&self) -> Vec<String> {
        self.bridge_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Host other nodes should dial.
    pub fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.host)
    }
}
