//! Custom error types for the monitor.
//!
//! Three enums cover the three places failures surface:
//!
//! - **`MonitorError`**: the application-level error. Configuration loading and
//!   validation, database access, telemetry store misuse and shutdown failures
//!   all end up here. `AppResult<T>` is the usual return type.
//! - **`DeviceError`**: what a driver reports back to its poller. The variants
//!   are classified so the poller loop can decide between "skip this payload",
//!   "count towards the cooldown" and "drop the handle and reconnect".
//! - **`CommandError`**: the outcome of a rejected control request. Its
//!   `Display` output is the human-readable message returned to the caller.
//!
//! By using `#[from]`, lower-level errors convert into `MonitorError` with `?`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

/// Convenience alias for driver calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Application-level error.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Config file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Config parsed but invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or process I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device driver failure.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Database driver failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Persistence pipeline failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No ring buffer with this key.
    #[error("Unknown telemetry channel '{0}'")]
    UnknownChannel(String),

    #[error("Channel '{key}' expects {expected} values, got {actual}")]
    ChannelWidth {
        key: String,
        expected: usize,
        actual: usize,
    },

    /// Rejected control request.
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Enabled device without a driver.
    #[error("No driver registered for device '{0}'")]
    DriverMissing(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },

    /// Errors collected while stopping.
    #[error("Shutdown failed with {} error(s): {}", .0.len(), join_errors(.0))]
    ShutdownFailed(Vec<MonitorError>),
}

impl From<figment::Error> for MonitorError {
    fn from(err: figment::Error) -> Self {
        MonitorError::Config(Box::new(err))
    }
}

fn join_errors(errors: &[MonitorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by a device driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Session could not be opened.
    #[error("Failed to open device: {0}")]
    Open(String),

    /// No reply in time.
    #[error("Device did not answer within {0:?}")]
    Timeout(Duration),

    /// Bus or link error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Session dropped; reconnect before retrying.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Reply could not be decoded.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Device refused the request.
    #[error("Device rejected request: {0}")]
    Rejected(String),

    /// Handle was closed by stop.
    #[error("Device handle closed")]
    Closed,

    /// No open session.
    #[error("Device not connected")]
    NotConnected,
}

impl DeviceError {
    /// True when the handle must be dropped so the next cycle reconnects.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_)
                | DeviceError::ConnectionLost(_)
                | DeviceError::Closed
                | DeviceError::NotConnected
        )
    }

    /// Malformed payloads are skipped without counting towards the cooldown.
    pub fn is_malformed(&self) -> bool {
        matches!(self, DeviceError::Malformed(_))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DeviceError::Transport(err.to_string()),
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => DeviceError::ConnectionLost(err.to_string()),
            _ => DeviceError::Transport(err.to_string()),
        }
    }
}

/// Rejected control request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Target device is not connected.
    #[error("Error: {0} device not connected.")]
    DeviceUnavailable(String),

    /// Scope does not match the device.
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Action not offered by the device.
    #[error("{device} does not support {action}")]
    Unsupported {
        /// Device name.
        device: String,
        /// Requested action.
        action: String,
    },

    /// Device failed while executing the command.
    #[error("{device} control error: {source}")]
    Device {
        /// Device name.
        device: String,
        /// Driver error.
        #[source]
        source: DeviceError,
    },

    /// Owning task did not reply in time.
    #[error("Timed out waiting for {0} to acknowledge")]
    Timeout(String),
}
