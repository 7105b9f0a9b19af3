//! Spool buffer and listener tuning.

use std::path::PathBuf;

use serde::Deserialize;

use super::ConfigError;
use crate::buffer::codec::HEADER_LEN;

/// Default maximum spool file size (1 GiB). Past this the backlog is discarded.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default upper bound accepted for a single record length prefix (100 MB).
pub const DEFAULT_MAX_RECORD_BYTES: u64 = 100 * 1024 * 1024;

/// Default number of rows leased per drain cycle.
pub const DEFAULT_LEASE_SIZE: usize = 100;

/// Default depth of the subscriber-facing channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Spool buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum spool file size in bytes.
    ///
    /// Default: 1,073,741,824 (1 GiB).
    pub max_size_bytes: u64,

    /// Largest record length considered plausible when reading back.
    ///
    /// Default: 104,857,600 (100 MB).
    pub max_record_bytes: u64,

    /// Rows leased per drain cycle.
    ///
    /// Default: 100.
    pub lease_size: usize,

    /// Directory for spool files. Defaults to the OS temporary directory.
    pub spool_dir: Option<PathBuf>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            lease_size: DEFAULT_LEASE_SIZE,
            spool_dir: None,
        }
    }
}

impl BufferConfig {
    /// Set the maximum spool file size.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_max_record_bytes(mut self, bytes: u64) -> Self {
        self.max_record_bytes = bytes;
        self
    }

    /// Set the drain batch size.
    pub fn with_lease_size(mut self, rows: usize) -> Self {
        self.lease_size = rows;
        self
    }

    /// Place spool files under `dir`.
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_size == 0 {
            return Err(ConfigError::Invalid("buffer.lease_size must be > 0".into()));
        }
        if self.max_size_bytes <= HEADER_LEN as u64 {
            return Err(ConfigError::Invalid(format!(
                "buffer.max_size_bytes must exceed the {HEADER_LEN} byte header"
            )));
        }
        if self.max_record_bytes == 0 {
            return Err(ConfigError::Invalid(
                "buffer.max_record_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Per-listener delivery defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Depth of the subscriber-facing channel.
    ///
    /// Default: 1. Direct delivery succeeds only while there is room.
    pub channel_capacity: usize,

    /// Never spool; `send` waits for the subscriber instead.
    pub disable_file_buffering: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            disable_file_buffering: false,
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "listener.channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}
