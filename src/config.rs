//! Runtime configuration.
//!
//! Every field has a default, so a missing or partial config file is fine.
//! The file lives at `~/.rusty-jobs/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// How files are moved between the local host and a session's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    /// base64 through a plain shell session of the same endpoint
    #[default]
    Channel,
    /// out-of-band `scp` launched from a local-only session
    Scp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on a single wait for PTY output before the deadline is re-checked.
    pub read_granularity_ms: u64,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Interactive shell started on the endpoint.
    pub shell: String,
    pub staging: StagingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_granularity_ms: 10,
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            shell: "/bin/sh".to_string(),
            staging: StagingMode::Channel,
        }
    }
}

impl SessionConfig {
    pub fn read_granularity(&self) -> Duration {
        Duration::from_millis(self.read_granularity_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Job store root on the endpoint. A leading `~/` is expanded there.
    pub base_dir: String,
    /// Watchdog interval; an idle supervisor exits after one to two intervals.
    pub idle_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.saga/adaptors/ssh_job".to_string(),
            idle_timeout_secs: 30,
        }
    }
}

/// Cadence of job-state polling in `wait()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: u32,
    /// How long `cancel()` waits for the monitor to record `CANCELED`.
    pub cancel_grace_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 1000,
            factor: 2,
            cancel_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
    pub poll: PollConfig,
}

impl Config {
    /// `~/.rusty-jobs/config.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rusty-jobs")
            .join("config.json")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config JSON at {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
