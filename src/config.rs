//! Daemon configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Command-line agent wrapped by the generic command backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Agent binary (e.g., `codex`, `claude`).
    pub program: String,
    /// Arguments for a fresh conversation; the message is appended last.
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments for a follow-up message. `{session_id}` is substituted.
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// Extra environment variables for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_max_concurrent_runs() -> u32 {
    4
}

/// Global configuration parsed from `dispatch.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DispatchConfig {
    /// Root directory of the run store.
    pub store_root: PathBuf,
    /// Daemon poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Backend deadline for requests that carry no `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Time a stopped process gets to exit before it is force-killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Ceiling on concurrently processed runs per daemon.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    /// Command backends keyed by engine name.
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
}

impl DispatchConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// The store root is created if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Daemon tick interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Grace window for [`stop`](crate::orchestrator::run_manager::RunManager::stop).
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    fn validate(&mut self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }

        if self.default_timeout_ms == 0 {
            return Err(AppError::Config(
                "default_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.max_concurrent_runs == 0 {
            return Err(AppError::Config(
                "max_concurrent_runs must be greater than zero".into(),
            ));
        }

        if let Some((name, _)) = self
            .engines
            .iter()
            .find(|(_, engine)| engine.program.trim().is_empty())
        {
            return Err(AppError::Config(format!(
                "engine {name} has an empty program"
            )));
        }

        fs::create_dir_all(&self.store_root)
            .map_err(|err| AppError::Config(format!("store_root invalid: {err}")))?;
        self.store_root = self
            .store_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("store_root invalid: {err}")))?;

        Ok(())
    }
}
