//! Relay configuration.
//!
//! Settings are resolved in three layers: built-in defaults, an optional TOML
//! file, then environment overrides. The result is validated once before the
//! daemon starts so that runtime code never sees a nonsensical value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::device::DeviceId;

/// Placeholder substituted with the device id in the upstream command.
pub const DEVICE_PLACEHOLDER: &str = "{device}";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "DEVRELAY_SOCKET";

/// Environment variable overriding the mirror directory.
pub const MIRROR_DIR_ENV: &str = "DEVRELAY_MIRROR_DIR";

/// Default Unix socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/devrelay.sock";

/// Default number of lines retained per device.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Default batch interval in milliseconds.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 100;

/// Default per-consumer byte threshold (5 MiB).
pub const DEFAULT_CONSUMER_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Default per-consumer queued message threshold.
pub const DEFAULT_CONSUMER_MAX_MESSAGES: usize = 1024;

/// Daemon configuration.
///
/// Every field has a default, so an empty TOML file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Path of the Unix socket viewers connect to.
    pub socket_path: PathBuf,

    /// Lines retained per device for backlog delivery.
    pub ring_capacity: usize,

    /// Interval between batch deliveries, in milliseconds.
    pub batch_interval_ms: u64,

    /// Bytes a consumer may have queued before batches are dropped for it.
    pub consumer_max_bytes: usize,

    /// Messages a consumer may have queued before batches are dropped for it.
    pub consumer_max_messages: usize,

    /// Upstream command line; `{device}` is replaced with the device id.
    pub command: Vec<String>,

    /// Directory for append-only per-device mirrors. Disabled when unset.
    pub mirror_dir: Option<PathBuf>,

    /// Time between SIGTERM and SIGKILL when stopping an upstream process.
    pub stop_grace_ms: u64,

    /// Maximum number of concurrently active device sessions.
    pub max_sessions: usize,

    /// Longest line kept intact; longer unterminated runs are split.
    pub max_line_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            ring_capacity: DEFAULT_RING_CAPACITY,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            consumer_max_bytes: DEFAULT_CONSUMER_MAX_BYTES,
            consumer_max_messages: DEFAULT_CONSUMER_MAX_MESSAGES,
            command: vec![
                "idevicesyslog".to_string(),
                "-u".to_string(),
                DEVICE_PLACEHOLDER.to_string(),
            ],
            mirror_dir: None,
            stop_grace_ms: 2000,
            max_sessions: 64,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl RelayConfig {
    /// Returns the default config file location (`<config_dir>/devrelay/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("devrelay").join("config.toml"))
    }

    /// Loads configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist. The default location is optional; when it
    /// is missing the built-in defaults are used. Environment overrides are
    /// applied and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config = Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                error,
            },
            other => other,
        })?;

        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Parses TOML text without validating it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: None,
            error: e.to_string(),
        })
    }

    /// Applies environment overrides using the given lookup function.
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|v| !v.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(dir) = lookup(MIRROR_DIR_ENV).filter(|v| !v.is_empty()) {
            self.mirror_dir = Some(PathBuf::from(dir));
        }
    }

    /// Checks that every value is usable at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval_ms == 0 {
            return Err(ConfigError::invalid("batch_interval_ms", "must be at least 1"));
        }
        if self.consumer_max_bytes == 0 {
            return Err(ConfigError::invalid("consumer_max_bytes", "must be greater than 0"));
        }
        if self.consumer_max_messages == 0 {
            return Err(ConfigError::invalid(
                "consumer_max_messages",
                "must be greater than 0",
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::invalid("max_sessions", "must be greater than 0"));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::invalid("max_line_bytes", "must be greater than 0"));
        }
        match self.command.first() {
            None => return Err(ConfigError::invalid("command", "must not be empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(ConfigError::invalid("command", "program must not be blank"));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Batch interval as a `Duration`.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Stop grace period as a `Duration`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Returns the upstream argv for a device, placeholders substituted.
    pub fn command_for(&self, device_id: &DeviceId) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(DEVICE_PLACEHOLDER, device_id.as_str()))
            .collect()
    }

    /// Returns the mirror file path for a device, if mirroring is enabled.
    pub fn mirror_path_for(&self, device_id: &DeviceId) -> Option<PathBuf> {
        self.mirror_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", device_id.file_stem())))
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config{}: {error}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse { path: Option<PathBuf>, error: String },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
