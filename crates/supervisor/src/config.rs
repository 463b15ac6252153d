//! Supervisor configuration.
//!
//! Stored as JSON. Every field has a default, so a partial (or missing) file
//! is fine; a file that does not parse is an error.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tether_connection::DEFAULT_MAX_RETRIES;
use tether_telemetry::{BackoffPolicy, PollerConfig};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between health check passes.
    pub health_check_interval_secs: u64,

    /// Consecutive automatic reconnect failures before giving up.
    pub max_retries: u32,

    /// Telemetry poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Extra telemetry fetch attempts within one poll cycle.
    pub max_inline_retries: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Whether the active connection is polled automatically.
    pub auto_refresh: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval_ms: 5000,
            max_inline_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            auto_refresh: true,
        }
    }
}

impl SupervisorConfig {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes configuration to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::ZeroHealthInterval);
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::BackoffOrder {
                base_ms: self.backoff_base_ms,
                max_ms: self.backoff_max_ms,
            });
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll_interval(),
            max_inline_retries: self.max_inline_retries,
            backoff: self.backoff(),
            auto_refresh: self.auto_refresh,
        }
    }
}
