//! Context configuration.
//!
//! [`WakeupConfig`] carries the tunables of a [`WakeupContext`](crate::WakeupContext).
//! Defaults suit production; tests usually disable the timer thread and pump
//! timers by hand against a virtual clock. With the `config-file` feature the
//! configuration can be loaded from TOML.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The straggler logging interval must be non-zero.
    #[error("straggler log interval must be non-zero")]
    ZeroStragglerInterval,
    /// The timer thread needs a name.
    #[error("timer thread name must not be empty")]
    EmptyThreadName,
    /// The configuration text could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(String),
}

/// Tunables for a wakeup context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WakeupConfig {
    /// Spawn a background worker that fires auto-release timers.
    pub timer_thread: bool,
    /// Name of the timer worker thread.
    pub timer_thread_name: String,
    /// How often a blocked `poll_blocking` call logs the sources still active.
    #[serde(with = "millis")]
    pub straggler_log_interval: Duration,
    /// Log the active sources whenever `is_pending` latches a pending wakeup.
    pub log_active_on_pending: bool,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            timer_thread: true,
            timer_thread_name: "wakeup-timer".to_owned(),
            straggler_log_interval: Duration::from_secs(1),
            log_active_on_pending: true,
        }
    }
}

impl WakeupConfig {
    /// Configuration for deterministic tests: no worker thread.
    #[must_use]
    pub fn manual_timers() -> Self {
        Self {
            timer_thread: false,
            ..Self::default()
        }
    }

    /// Checks the configuration for values the context cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.straggler_log_interval.is_zero() {
            return Err(ConfigError::ZeroStragglerInterval);
        }
        if self.timer_thread && self.timer_thread_name.trim().is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        Ok(())
    }

    /// Parses and validates a TOML configuration.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML configuration file.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
