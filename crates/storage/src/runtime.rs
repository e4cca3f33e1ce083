//! Runtime-tunable tick options
//!
//! Tick pacing can be changed while the node runs. Options are published as
//! immutable snapshots through an atomic pointer swap; a tick loads one
//! snapshot per batch, so an update takes effect at the next batch boundary
//! and never part-way through a batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chronoshard_core::{Result, ShardError};
use tracing::debug;

use crate::config::RuntimeConfig;

/// One immutable set of tick options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Entries processed per batch
    pub tick_series_batch_size: usize,
    /// Fixed sleep between batches
    pub tick_batch_sleep: Duration,
    /// Additional sleep per entry processed in the preceding batch
    pub tick_per_series_sleep: Duration,
}

impl RuntimeOptions {
    /// Check the options are usable
    pub fn validate(&self) -> Result<()> {
        if self.tick_series_batch_size == 0 {
            return Err(ShardError::invalid_input(
                "tick_series_batch_size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Sleep owed after a batch of `batch_len` entries
    pub fn batch_sleep(&self, batch_len: usize) -> Duration {
        let per_series = self
            .tick_per_series_sleep
            .saturating_mul(batch_len.min(u32::MAX as usize) as u32);
        self.tick_batch_sleep.saturating_add(per_series)
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for RuntimeOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            tick_series_batch_size: config.tick_series_batch_size,
            tick_batch_sleep: Duration::from_micros(config.tick_batch_sleep_us),
            tick_per_series_sleep: Duration::from_micros(config.tick_per_series_sleep_us),
        }
    }
}

/// Publishes [`RuntimeOptions`] snapshots
///
/// Readers never block: `get()` is a lock-free pointer load. After
/// `close()` the last snapshot stays readable but can no longer change.
pub struct RuntimeOptionsManager {
    current: ArcSwap<RuntimeOptions>,
    closed: AtomicBool,
}

impl RuntimeOptionsManager {
    /// Manager publishing `initial`
    pub fn new(initial: RuntimeOptions) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            closed: AtomicBool::new(false),
        })
    }

    /// Current snapshot
    pub fn get(&self) -> Arc<RuntimeOptions> {
        self.current.load_full()
    }

    /// Publish a new snapshot
    ///
    /// # Errors
    ///
    /// `InvalidInput` for unusable options, `ShardClosed` after `close()`.
    pub fn update(&self, options: RuntimeOptions) -> Result<()> {
        if self.is_closed() {
            return Err(ShardError::ShardClosed);
        }
        options.validate()?;
        debug!(
            batch_size = options.tick_series_batch_size,
            batch_sleep_us = options.tick_batch_sleep.as_micros() as u64,
            per_series_sleep_us = options.tick_per_series_sleep.as_micros() as u64,
            "runtime options updated"
        );
        self.current.store(Arc::new(options));
        Ok(())
    }

    /// Stop accepting updates
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for RuntimeOptionsManager {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuntimeOptions::default()),
            closed: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for RuntimeOptionsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptionsManager")
            .field("current", &self.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(batch: usize) -> RuntimeOptions {
        RuntimeOptions {
            tick_series_batch_size: batch,
            tick_batch_sleep: Duration::from_millis(1),
            tick_per_series_sleep: Duration::from_micros(10),
        }
    }

    #[test]
    fn test_batch_sleep_scales_with_batch() {
        let opts = options(10);
        assert_eq!(opts.batch_sleep(0), Duration::from_millis(1));
        assert_eq!(opts.batch_sleep(10), Duration::from_micros(1_100));
    }

    #[test]
    fn test_update_publishes_new_snapshot() {
        let manager = RuntimeOptionsManager::new(options(10)).unwrap();
        let before = manager.get();

        manager.update(options(20)).unwrap();

        // Held snapshots are unaffected by the swap.
        assert_eq!(before.tick_series_batch_size, 10);
        assert_eq!(manager.get().tick_series_batch_size, 20);
    }

    #[test]
    fn test_update_rejects_zero_batch() {
        let manager = RuntimeOptionsManager::new(options(10)).unwrap();
        let err = manager.update(options(0)).unwrap_err();
        assert!(matches!(err, ShardError::InvalidInput(_)));
        assert_eq!(manager.get().tick_series_batch_size, 10);
        assert!(RuntimeOptionsManager::new(options(0)).is_err());
    }

    #[test]
    fn test_closed_manager_keeps_last_snapshot() {
        let manager = RuntimeOptionsManager::new(options(10)).unwrap();
        manager.close();

        assert!(manager.is_closed());
        assert_eq!(manager.update(options(5)), Err(ShardError::ShardClosed));
        assert_eq!(manager.get().tick_series_batch_size, 10);
    }
}
