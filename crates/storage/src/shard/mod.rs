//! The shard: one partition of the series keyspace
//!
//! A [`Shard`] owns a [`SeriesMap`] and exposes the four operations that
//! must compose under arbitrary concurrency:
//!
//! - [`Shard::write`]: append one datapoint
//! - [`Shard::tick`]: seal, flush, expire and evict, in paced batches
//! - [`Shard::bootstrap`]: merge a bulk historical load
//! - [`Shard::fetch_blocks_metadata`]: paged block metadata over a snapshot
//!
//! No operation takes a shard-wide lock for its whole duration. The only
//! shard-level lock is the tick lock, which keeps tick passes single-flight
//! and lets `close()` wait for an in-flight pass.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing -> Bootstrapping -> Bootstrapped -> Closing -> Closed
//! ```
//!
//! Transitions are compare-and-swap on an atomic state word. Writes are
//! accepted before bootstrap unless the config says otherwise; reads and
//! fetches wait for `Bootstrapped`; tick runs in any open state but only
//! expires data once bootstrapped.

mod bootstrap;
mod fetch;
mod tick;
mod write;

pub use bootstrap::{BootstrapOutcome, BootstrapResult, SeriesBlocks};
pub use fetch::{FetchBlocksMetadataPage, PageToken, SeriesBlocksMetadata};
pub use tick::TickResult;
pub use write::{SeriesRef, WriteOptions, WriteOutcome};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chronoshard_core::{Result, SeriesId, ShardError, Tags};
use parking_lot::Mutex;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::ShardConfig;
use crate::entry::SeriesEntry;
use crate::flush::{BlockFlusher, NoopFlusher};
use crate::map::SeriesMap;
use crate::runtime::{RuntimeOptions, RuntimeOptionsManager};

/// Lifecycle state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ShardState {
    /// Created, bootstrap not started
    Initializing = 0,
    /// Bootstrap in progress
    Bootstrapping = 1,
    /// Fully operational
    Bootstrapped = 2,
    /// `close()` in progress
    Closing = 3,
    /// Closed; every operation is rejected
    Closed = 4,
}

impl ShardState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShardState::Initializing,
            1 => ShardState::Bootstrapping,
            2 => ShardState::Bootstrapped,
            3 => ShardState::Closing,
            _ => ShardState::Closed,
        }
    }

    /// Whether the shard is closing or closed
    pub fn is_closed(&self) -> bool {
        matches!(self, ShardState::Closing | ShardState::Closed)
    }

    /// Whether bootstrap has completed
    pub fn is_bootstrapped(&self) -> bool {
        *self == ShardState::Bootstrapped
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardState::Initializing => "initializing",
            ShardState::Bootstrapping => "bootstrapping",
            ShardState::Bootstrapped => "bootstrapped",
            ShardState::Closing => "closing",
            ShardState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One shard of series data
///
/// # Thread Safety
///
/// `Shard` is `Send + Sync`; share it behind an `Arc` and call any
/// operation from any thread.
///
/// # Example
///
/// ```ignore
/// use chronoshard_storage::{Shard, ShardConfig, WriteOptions};
/// use chronoshard_core::{SeriesId, Timestamp, TimeUnit};
///
/// let shard = Shard::new(0, ShardConfig::default())?;
/// let id = SeriesId::from("cpu.user");
/// let outcome = shard.write(&id, Timestamp::now(), 0.5, TimeUnit::Second, None, &WriteOptions::default())?;
/// assert!(outcome.was_written);
/// ```
pub struct Shard {
    id: u32,
    config: ShardConfig,
    series: SeriesMap,
    state: AtomicU8,
    runtime: Arc<RuntimeOptionsManager>,
    flusher: Arc<dyn BlockFlusher>,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a tick pass
    tick_lock: Mutex<()>,
    tick_count: AtomicU64,
}

impl Shard {
    /// Shard with default collaborators: system clock, no-op flusher and a
    /// private runtime options manager seeded from `config.runtime`.
    pub fn new(id: u32, config: ShardConfig) -> Result<Self> {
        ShardBuilder::new(id).config(config).build()
    }

    /// Start building a shard with custom collaborators
    pub fn builder(id: u32) -> ShardBuilder {
        ShardBuilder::new(id)
    }

    /// Shard id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Static configuration
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShardState {
        ShardState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of completed tick passes
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// Current runtime options snapshot
    pub fn runtime_options(&self) -> Arc<RuntimeOptions> {
        self.runtime.get()
    }

    /// Runtime options manager driving this shard's ticks
    pub fn runtime_manager(&self) -> &Arc<RuntimeOptionsManager> {
        &self.runtime
    }

    /// Live entry for `id`
    pub fn lookup(&self, id: &SeriesId) -> Option<Arc<SeriesEntry>> {
        if self.state().is_closed() {
            return None;
        }
        self.series.lookup(id)
    }

    /// Number of series currently held
    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    /// Close the shard.
    ///
    /// Waits for an in-flight tick pass to stop, then drops all series.
    /// Operations started afterwards fail with `ShardClosed`.
    ///
    /// # Errors
    ///
    /// `ShardClosed` if the shard was already closing or closed.
    pub fn close(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ShardState::from_u8(current).is_closed() {
                return Err(ShardError::ShardClosed);
            }
            match self.state.compare_exchange(
                current,
                ShardState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // A running tick notices Closing at its next batch boundary.
        let _tick = self.tick_lock.lock();
        let dropped = self.series.clear();
        self.state.store(ShardState::Closed as u8, Ordering::Release);
        info!(shard = self.id, series = dropped, "shard closed");
        Ok(())
    }

    fn transition(&self, from: ShardState, to: ShardState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn check_writable(&self) -> Result<()> {
        match self.state() {
            ShardState::Bootstrapped => Ok(()),
            ShardState::Initializing | ShardState::Bootstrapping
                if self.config.accept_writes_before_bootstrap =>
            {
                Ok(())
            }
            ShardState::Initializing | ShardState::Bootstrapping => {
                Err(ShardError::NotBootstrapped)
            }
            ShardState::Closing | ShardState::Closed => Err(ShardError::ShardClosed),
        }
    }

    fn check_readable(&self) -> Result<()> {
        match self.state() {
            ShardState::Bootstrapped => Ok(()),
            ShardState::Initializing | ShardState::Bootstrapping => {
                Err(ShardError::NotBootstrapped)
            }
            ShardState::Closing | ShardState::Closed => Err(ShardError::ShardClosed),
        }
    }

    /// Undo an insert that raced with `close()` clearing the map.
    fn release_if_closed(&self, entry: &Arc<SeriesEntry>) -> Result<()> {
        if self.state().is_closed() {
            self.series.remove_if(entry.id(), entry);
            return Err(ShardError::ShardClosed);
        }
        Ok(())
    }

    fn new_entry(&self, id: &SeriesId, tags: &Tags, index: u64) -> SeriesEntry {
        SeriesEntry::new(id.clone(), tags.clone(), index, self.clock.now())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("series", &self.series.len())
            .field("tick_count", &self.tick_count())
            .finish()
    }
}

/// Builder for a [`Shard`] with custom collaborators
pub struct ShardBuilder {
    id: u32,
    config: ShardConfig,
    runtime: Option<Arc<RuntimeOptionsManager>>,
    flusher: Arc<dyn BlockFlusher>,
    clock: Arc<dyn Clock>,
}

impl ShardBuilder {
    /// Builder with default config and collaborators
    pub fn new(id: u32) -> Self {
        Self {
            id,
            config: ShardConfig::default(),
            runtime: None,
            flusher: Arc::new(NoopFlusher),
            clock: Arc::new(SystemClock),
        }
    }

    /// Static configuration
    pub fn config(mut self, config: ShardConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing runtime options manager instead of seeding a
    /// private one from the config
    pub fn runtime_options(mut self, manager: Arc<RuntimeOptionsManager>) -> Self {
        self.runtime = Some(manager);
        self
    }

    /// Receiver of sealed blocks
    pub fn flusher(mut self, flusher: Arc<dyn BlockFlusher>) -> Self {
        self.flusher = flusher;
        self
    }

    /// Time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the config and build the shard
    pub fn build(self) -> Result<Shard> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(RuntimeOptionsManager::new(RuntimeOptions::from(
                &self.config.runtime,
            ))?),
        };
        Ok(Shard {
            id: self.id,
            series: SeriesMap::new(self.config.map_buckets),
            config: self.config,
            state: AtomicU8::new(ShardState::Initializing as u8),
            runtime,
            flusher: self.flusher,
            clock: self.clock,
            tick_lock: Mutex::new(()),
            tick_count: AtomicU64::new(0),
        })
    }
}
