//! Shard configuration via `shard.toml`
//!
//! Static options are fixed when the shard is built. The `[runtime]` table
//! only seeds the [`RuntimeOptionsManager`](crate::RuntimeOptionsManager);
//! later changes go through the manager, not the file.
//!
//! All durations are integer milliseconds, except the tick sleeps in
//! `[runtime]` which are microseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use chronoshard_core::{Result, ShardError};

/// Config file name conventionally used for a shard
pub const CONFIG_FILE_NAME: &str = "shard.toml";

/// How a write resolves an existing point at the same timestamp with a
/// different value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The newer value replaces the stored one
    #[default]
    LastWriteWins,
    /// The stored value is kept and the write fails with `InvalidInput`
    Reject,
}

/// Initial tick pacing, see [`RuntimeOptions`](crate::RuntimeOptions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Entries processed per tick batch
    pub tick_series_batch_size: usize,
    /// Fixed sleep between batches, microseconds
    pub tick_batch_sleep_us: u64,
    /// Sleep per processed entry, microseconds
    pub tick_per_series_sleep_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_series_batch_size: 512,
            tick_batch_sleep_us: 0,
            tick_per_series_sleep_us: 1,
        }
    }
}

/// Shard configuration loaded from `shard.toml`.
///
/// # Example
///
/// ```toml
/// block_size_ms = 7200000
/// retention_period_ms = 172800000
/// duplicate_policy = "last_write_wins"
///
/// [runtime]
/// tick_series_batch_size = 512
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Width of one block
    pub block_size_ms: u64,
    /// How long data is kept after its block ends
    pub retention_period_ms: u64,
    /// How far behind "now" writes are accepted; also the grace period
    /// before an ended block is sealed
    pub buffer_past_ms: u64,
    /// How far ahead of "now" writes are accepted
    pub buffer_future_ms: u64,
    /// An empty series untouched for this long is evicted by tick
    pub series_idle_window_ms: u64,
    /// Resolution of conflicting writes to the same timestamp
    pub duplicate_policy: DuplicatePolicy,
    /// Accept writes while the shard is not yet bootstrapped
    pub accept_writes_before_bootstrap: bool,
    /// Lock stripes of the series map
    pub map_buckets: usize,
    /// Initial runtime options
    pub runtime: RuntimeConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            block_size_ms: 2 * 60 * 60 * 1000,
            retention_period_ms: 48 * 60 * 60 * 1000,
            buffer_past_ms: 10 * 60 * 1000,
            buffer_future_ms: 2 * 60 * 1000,
            series_idle_window_ms: 10 * 60 * 1000,
            duplicate_policy: DuplicatePolicy::LastWriteWins,
            accept_writes_before_bootstrap: true,
            map_buckets: 16,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ShardConfig {
    /// Block width
    pub fn block_size(&self) -> Duration {
        Duration::from_millis(self.block_size_ms)
    }

    /// Retention period
    pub fn retention_period(&self) -> Duration {
        Duration::from_millis(self.retention_period_ms)
    }

    /// Write grace period into the past
    pub fn buffer_past(&self) -> Duration {
        Duration::from_millis(self.buffer_past_ms)
    }

    /// Write grace period into the future
    pub fn buffer_future(&self) -> Duration {
        Duration::from_millis(self.buffer_future_ms)
    }

    /// Idle window before an empty series is evicted
    pub fn series_idle_window(&self) -> Duration {
        Duration::from_millis(self.series_idle_window_ms)
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.block_size_ms == 0 {
            return Err(ShardError::config("block_size_ms must be greater than zero"));
        }
        if self.retention_period_ms < self.block_size_ms {
            return Err(ShardError::config(
                "retention_period_ms must be at least block_size_ms",
            ));
        }
        if self.buffer_past_ms >= self.block_size_ms {
            return Err(ShardError::config("buffer_past_ms must be below block_size_ms"));
        }
        if self.series_idle_window_ms == 0 {
            return Err(ShardError::config(
                "series_idle_window_ms must be greater than zero",
            ));
        }
        if self.map_buckets == 0 {
            return Err(ShardError::config("map_buckets must be greater than zero"));
        }
        if self.runtime.tick_series_batch_size == 0 {
            return Err(ShardError::config(
                "runtime.tick_series_batch_size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Shard configuration
#
# Block width in milliseconds (default: 2 hours)
block_size_ms = 7200000

# Data is dropped once its block ended this long ago (default: 48 hours)
retention_period_ms = 172800000

# Writes may be this far behind now; blocks are sealed once they ended
# this long ago (default: 10 minutes, must be below block_size_ms)
buffer_past_ms = 600000

# Writes may be this far ahead of now (default: 2 minutes)
buffer_future_ms = 120000

# Empty series untouched for this long are evicted (default: 10 minutes)
series_idle_window_ms = 600000

# Conflicting write to an existing timestamp: "last_write_wins" or "reject"
duplicate_policy = "last_write_wins"

# Accept and buffer writes that arrive before bootstrap completes
accept_writes_before_bootstrap = true

# Lock stripes of the series map
map_buckets = 16

[runtime]
# Entries per tick batch
tick_series_batch_size = 512
# Sleep between tick batches, microseconds
tick_batch_sleep_us = 0
# Extra sleep per processed entry, microseconds
tick_per_series_sleep_us = 1
"#
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ShardConfig = toml::from_str(content)
            .map_err(|e| ShardError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ShardError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ShardError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            ShardError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
