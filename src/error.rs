//! Error types.
//!
//! Most wakeup operations cannot fail: reporting events on an absent or
//! unregistered source is a defensive no-op. The errors here cover the
//! device glue and context construction.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors returned by wakeup-source and device operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WakeupError {
    /// The device already has a wakeup source attached.
    #[error("device '{device}' already has a wakeup source")]
    AlreadyExists {
        /// Name of the device.
        device: String,
    },
    /// The device is not capable of waking the system.
    #[error("device '{device}' cannot wake the system")]
    NotCapable {
        /// Name of the device.
        device: String,
    },
    /// The device has no wakeup source attached.
    #[error("device '{device}' has no wakeup source")]
    NoSource {
        /// Name of the device.
        device: String,
    },
    /// The timer worker thread could not be spawned.
    #[error("failed to spawn timer worker: {0}")]
    TimerThread(String),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WakeupError {
    /// Returns true for the "already exists" condition of [`attach`](crate::Device).
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Result alias for wakeup operations.
pub type Result<T> = std::result::Result<T, WakeupError>;
