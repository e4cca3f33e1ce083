//! Flush collaborator
//!
//! Tick hands every newly sealed block to a [`BlockFlusher`]. A block stays
//! `Pending` in memory until the flusher accepts it, and is offered again on
//! every later tick until it does (at-least-once handoff).

use std::sync::atomic::{AtomicBool, Ordering};

use chronoshard_core::{Result, SeriesId, ShardError, Timestamp};
use parking_lot::Mutex;

use crate::block::SealedBlock;

/// Receives sealed blocks for persistence
///
/// Implementations must be `Send + Sync`; tick calls them from whatever
/// thread runs the pass, without holding the series' lock.
pub trait BlockFlusher: Send + Sync {
    /// Persist a sealed block of series `id`.
    ///
    /// An error leaves the block pending; it is retried on the next tick.
    fn on_block_sealed(&self, id: &SeriesId, block: &SealedBlock) -> Result<()>;
}

/// Accepts every block and discards it
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlusher;

impl BlockFlusher for NoopFlusher {
    fn on_block_sealed(&self, _id: &SeriesId, _block: &SealedBlock) -> Result<()> {
        Ok(())
    }
}

/// Keeps a record of every accepted block; can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingFlusher {
    flushed: Mutex<Vec<(SeriesId, Timestamp, u32)>>,
    failing: AtomicBool,
}

impl RecordingFlusher {
    /// New flusher that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent flushes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// `(series, block start, checksum)` of every accepted block, in order
    pub fn flushed(&self) -> Vec<(SeriesId, Timestamp, u32)> {
        self.flushed.lock().clone()
    }

    /// Number of accepted blocks
    pub fn len(&self) -> usize {
        self.flushed.lock().len()
    }

    /// Whether nothing has been accepted yet
    pub fn is_empty(&self) -> bool {
        self.flushed.lock().is_empty()
    }
}

impl BlockFlusher for RecordingFlusher {
    fn on_block_sealed(&self, id: &SeriesId, block: &SealedBlock) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ShardError::Flush(format!(
                "flush of {} block {} rejected",
                id,
                block.start()
            )));
        }
        self.flushed
            .lock()
            .push((id.clone(), block.start(), block.checksum()));
        Ok(())
    }
}
