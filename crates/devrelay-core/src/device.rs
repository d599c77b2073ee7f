//! Device identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Opaque identifier of a physical or virtual device whose logs are streamed.
///
/// Typically a device UDID or an emulator serial (e.g. "emulator-5554").
/// Lookups are exact string matches; no normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new DeviceId without validation.
    ///
    /// Prefer [`DeviceId::parse`] for identifiers received from clients.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a device id received from the outside world.
    ///
    /// Rejects empty identifiers and identifiers with surrounding whitespace,
    /// since those would never match the device tool's own naming.
    pub fn parse(id: &str) -> DomainResult<Self> {
        if id.is_empty() {
            return Err(DomainError::InvalidDeviceId {
                value: id.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if id.trim() != id {
            return Err(DomainError::InvalidDeviceId {
                value: id.to_string(),
                reason: "must not have leading or trailing whitespace".to_string(),
            });
        }
        Ok(Self(id.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a filesystem-safe stem for per-device files.
    ///
    /// Every character outside `[A-Za-z0-9._-]` becomes `_`, so ids like
    /// "usb:1-1.2" cannot escape the mirror directory.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        // "." and ".." are valid under the rule above but are not file names
        if stem.chars().all(|c| c == '.') {
            stem.replace('.', "_")
        } else {
            stem
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
