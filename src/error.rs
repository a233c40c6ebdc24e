//! Custom error types for the scanner core.
//!
//! `ScanError` is the single error type of the library. It follows the
//! taxonomy the rest of the crate relies on:
//!
//! - **`Device`**: any non-success status returned by a device-control call.
//!   Carries the action that was attempted ("opening device", "setting option",
//!   "reading line", ...) and the device status, whose `Display` is the
//!   protocol's own textual status.
//! - **`NotScanning`** / **`AlreadyScanning`**: structural state errors. The
//!   edges of the system (UI bindings, the worker front end) treat these as
//!   harmless races and no-op them; the core still reports them so direct
//!   callers can tell what happened.
//! - **`WorkerStopped`**: the background worker thread is gone.
//! - **`Config`**: configuration could not be loaded.
//!
//! Option reads and writes that fail are logged and degraded by the registry
//! and apply/reload code rather than propagated; scan failures end only the
//! current scan. Nothing in here is ever fatal to the process.

use thiserror::Error;

use crate::device::DeviceStatus;

/// Convenience alias for results using the scanner error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Errors produced by the scanner core.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A device-control call returned a non-success status.
    #[error("{action} failed: {status}")]
    Device {
        /// What the core was trying to do.
        action: String,
        /// Status reported by the device.
        status: DeviceStatus,
    },

    /// A scan operation was requested while no scan is in progress.
    #[error("No scan in progress")]
    NotScanning,

    /// A scan was requested while another one is in progress.
    #[error("A scan is already in progress")]
    AlreadyScanning,

    /// The background worker is no longer running.
    #[error("Scan worker has stopped")]
    WorkerStopped,

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Operating-system I/O failure (thread spawn, output files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Build a device error for `action`.
    pub fn device(action: impl Into<String>, status: DeviceStatus) -> Self {
        Self::Device {
            action: action.into(),
            status,
        }
    }

    /// Device status carried by this error, if it came from the device.
    pub fn status(&self) -> Option<DeviceStatus> {
        match self {
            Self::Device { status, .. } => Some(*status),
            _ => None,
        }
    }
}
