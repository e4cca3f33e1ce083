//! Tick: periodic maintenance pass
//!
//! A pass walks the series map in batches. Per entry it seals blocks that
//! fell out of the write window, hands pending sealed blocks to the
//! flusher, drops blocks past retention and evicts entries left empty and
//! idle. Batch size and pacing come from the runtime options snapshot
//! loaded at each batch boundary.

use std::thread;

use chronoshard_core::{EntryFailure, Result, ShardError};
use tracing::debug;

use super::{Shard, ShardState};
use crate::cancel::Cancellable;
use crate::entry::TickContext;

/// Counts gathered by one tick pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickResult {
    /// Entries kept after the pass
    pub active_series: usize,
    /// Entries evicted by the pass
    pub expired_series: usize,
    /// Open blocks held by active entries
    pub open_blocks: usize,
    /// Sealed blocks held by active entries
    pub sealed_blocks: usize,
    /// Blocks sealed during the pass
    pub newly_sealed_blocks: usize,
    /// Blocks accepted by the flusher during the pass
    pub flushed_blocks: usize,
    /// Blocks dropped for retention
    pub expired_blocks: usize,
    /// Evictions that found the entry already replaced in the map
    pub eviction_races: usize,
    /// Per-entry failures; none of them aborted the pass
    pub errors: Vec<EntryFailure>,
}

impl TickResult {
    /// Whether any entry failed
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Treat per-entry failures as an error
    pub fn into_result(self) -> Result<TickResult> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(ShardError::PartialFailure {
                failed: self.errors,
            })
        }
    }
}

impl Shard {
    /// Run one tick pass.
    ///
    /// At most one pass runs per shard; per-entry failures (flush errors)
    /// are collected in the result and never abort the pass. Before
    /// bootstrap completes, blocks are sealed and flushed but nothing is
    /// expired or evicted.
    ///
    /// # Errors
    ///
    /// - `TickInProgress` if another pass is running
    /// - `Cancelled` if `cancel` fired at a batch boundary
    /// - `ShardClosed` if the shard is or starts closing
    pub fn tick(&self, cancel: &dyn Cancellable) -> Result<TickResult> {
        if self.state().is_closed() {
            return Err(ShardError::ShardClosed);
        }
        let Some(_guard) = self.tick_lock.try_lock() else {
            return Err(ShardError::TickInProgress);
        };

        let mut result = TickResult::default();
        let mut options = self.runtime.get();
        let mut series = self.series.iter();
        let mut batches = 0usize;

        loop {
            if cancel.is_cancelled() {
                debug!(shard = self.id, batches, "tick cancelled");
                return Err(ShardError::Cancelled);
            }
            let state = self.state();
            if state.is_closed() {
                debug!(shard = self.id, batches, "tick stopped, shard closing");
                return Err(ShardError::ShardClosed);
            }
            // A closed manager keeps serving its last snapshot.
            if !self.runtime.is_closed() {
                options = self.runtime.get();
            }

            let batch_size = options.tick_series_batch_size;
            let batch = series.next_batch(batch_size);
            if batch.is_empty() {
                break;
            }
            batches += 1;

            let ctx = TickContext {
                now: self.clock.now(),
                block_size: self.config.block_size(),
                buffer_past: self.config.buffer_past(),
                retention: self.config.retention_period(),
                idle_window: self.config.series_idle_window(),
                expire: state == ShardState::Bootstrapped,
                flusher: self.flusher.as_ref(),
            };

            for entry in &batch {
                let report = entry.tick(&ctx);
                result.newly_sealed_blocks += report.newly_sealed;
                result.flushed_blocks += report.flushed;
                result.expired_blocks += report.expired_blocks;
                result
                    .errors
                    .extend(report.failures.into_iter().map(|e| EntryFailure::new(entry.id().clone(), e)));

                if !report.retired {
                    result.active_series += 1;
                    result.open_blocks += report.open_blocks;
                    result.sealed_blocks += report.sealed_blocks;
                } else if self.series.remove_if(entry.id(), entry) {
                    result.expired_series += 1;
                } else {
                    debug!(shard = self.id, series = %entry.id(), "evicted entry already replaced");
                    result.eviction_races += 1;
                }
            }

            if batch.len() < batch_size {
                break;
            }
            let pause = options.batch_sleep(batch.len());
            drop(batch);
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        self.tick_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        debug!(
            shard = self.id,
            batches,
            active = result.active_series,
            expired = result.expired_series,
            sealed = result.newly_sealed_blocks,
            flushed = result.flushed_blocks,
            expired_blocks = result.expired_blocks,
            errors = result.errors.len(),
            "tick complete"
        );
        Ok(result)
    }
}
