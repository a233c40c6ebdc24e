//! Configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. built-in defaults
//! 2. `rust_scan.toml` (or an explicit path)
//! 3. environment variables prefixed with `RUSTSCAN_`, nested keys split on `__`
//!
//! ```text
//! RUSTSCAN_APPLICATION__LOG_LEVEL=debug
//! RUSTSCAN_DEVICES__DEFAULT_DEVICE="genesys:libusb:001:004"
//! RUSTSCAN_WORKER__EVENT_CAPACITY=4
//! ```
//!
//! A missing file is not an error; defaults and environment still apply.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScanError};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "rust_scan.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RUSTSCAN_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device discovery settings
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Background worker settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Device discovery configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Only list locally attached devices
    #[serde(default)]
    pub local_only: bool,
    /// Device opened when none is named explicitly
    #[serde(default)]
    pub default_device: Option<String>,
}

/// Background worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Events the worker may queue ahead of the controller. 1 keeps exactly
    /// one line in flight.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Name of the worker thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    1
}

fn default_thread_name() -> String {
    "scan-worker".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            thread_name: default_thread_name(),
        }
    }
}

impl ScanConfig {
    /// Load from `rust_scan.toml` in the working directory and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values figment cannot check by type alone.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.worker.event_capacity == 0 {
            return Err(ScanError::Configuration(
                "worker.event_capacity must be at least 1".to_string(),
            ));
        }

        if self.worker.thread_name.trim().is_empty() {
            return Err(ScanError::Configuration(
                "worker.thread_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.worker.event_capacity, 1);
        assert_eq!(config.worker.thread_name, "scan-worker");
        assert_eq!(config.application.log_level, "info");
        assert!(config.devices.default_device.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [devices]
            local_only = true
            default_device = "mock:flatbed"

            [worker]
            event_capacity = 4
            "#,
        );

        let config = ScanConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert!(config.devices.local_only);
        assert_eq!(config.devices.default_device.as_deref(), Some("mock:flatbed"));
        assert_eq!(config.worker.event_capacity, 4);
        assert_eq!(config.worker.thread_name, "scan-worker");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let file = write_config("[worker]\nevent_capacity = 0\n");
        let err = ScanConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = ScanConfig::default();
        config.application.log_level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let file = write_config("[worker]\nevent_capacity = \"many\"\n");
        let err = ScanConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }
}
