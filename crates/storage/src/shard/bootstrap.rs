//! Bootstrap: bulk load of historical blocks
//!
//! Bootstrap runs once per shard. Each series in the result is merged into
//! the live entry for its id (created if absent) under that entry's lock,
//! so writes and ticks keep running against every other series. Live data
//! wins wherever both sides hold a point for the same timestamp.
//!
//! A series that cannot be merged is recorded as a failure and skipped;
//! series merged before it stay merged.

use std::time::Duration;

use chronoshard_core::{EntryFailure, Result, SeriesId, ShardError, Tags};
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use super::{Shard, ShardState};
use crate::block::SealedBlock;
use crate::entry::{IncomingBlock, Merge};

/// Historical blocks of one series
#[derive(Debug, Clone)]
pub struct SeriesBlocks {
    /// Series id
    pub id: SeriesId,
    /// Series tags
    pub tags: Tags,
    /// Sealed blocks, in any order
    pub blocks: Vec<SealedBlock>,
}

impl SeriesBlocks {
    /// Series without blocks
    pub fn new(id: SeriesId, tags: Tags) -> Self {
        Self {
            id,
            tags,
            blocks: Vec::new(),
        }
    }

    /// Add a block (builder style)
    pub fn with_block(mut self, block: SealedBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Add a block
    pub fn push(&mut self, block: SealedBlock) {
        self.blocks.push(block);
    }
}

/// Payload of one bootstrap: series id to historical blocks
#[derive(Debug, Clone, Default)]
pub struct BootstrapResult {
    series: FxHashMap<SeriesId, SeriesBlocks>,
}

impl BootstrapResult {
    /// Empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series; blocks for an id already present are appended to it
    pub fn add(&mut self, series: SeriesBlocks) {
        match self.series.get_mut(&series.id) {
            Some(existing) => existing.blocks.extend(series.blocks),
            None => {
                self.series.insert(series.id.clone(), series);
            }
        }
    }

    /// Blocks for `id`
    pub fn get(&self, id: &SeriesId) -> Option<&SeriesBlocks> {
        self.series.get(id)
    }

    /// Number of series
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether the result holds no series
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Consume into the contained series
    pub fn into_series(self) -> impl Iterator<Item = SeriesBlocks> {
        self.series.into_values()
    }
}

impl FromIterator<SeriesBlocks> for BootstrapResult {
    fn from_iter<I: IntoIterator<Item = SeriesBlocks>>(iter: I) -> Self {
        let mut result = BootstrapResult::new();
        for series in iter {
            result.add(series);
        }
        result
    }
}

/// Summary of a bootstrap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapOutcome {
    /// Series that did not exist before the merge
    pub series_created: usize,
    /// Series merged into an entry that already existed
    pub series_merged: usize,
    /// Blocks installed where the entry had none
    pub blocks_installed: usize,
    /// Blocks merged into an existing block
    pub blocks_merged: usize,
    /// Points added to existing blocks
    pub points_filled: usize,
    /// Series that could not be merged
    pub failures: Vec<EntryFailure>,
}

impl BootstrapOutcome {
    /// Whether any series failed
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Treat per-series failures as an error
    pub fn into_result(self) -> Result<BootstrapOutcome> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ShardError::PartialFailure {
                failed: self.failures,
            })
        }
    }
}

impl Shard {
    /// Merge a bootstrap result and mark the shard bootstrapped.
    ///
    /// Succeeds even when some series fail to merge; those are listed in
    /// [`BootstrapOutcome::failures`].
    ///
    /// # Errors
    ///
    /// - `AlreadyBootstrapped` if a bootstrap already started or finished
    /// - `ShardClosed` if the shard is or starts closing
    pub fn bootstrap(&self, result: BootstrapResult) -> Result<BootstrapOutcome> {
        if !self.transition(ShardState::Initializing, ShardState::Bootstrapping) {
            return Err(match self.state() {
                ShardState::Closing | ShardState::Closed => ShardError::ShardClosed,
                _ => ShardError::AlreadyBootstrapped,
            });
        }
        info!(shard = self.id, series = result.len(), "bootstrap started");

        let block_size = self.config.block_size();
        let buffer_past = self.config.buffer_past();
        let mut outcome = BootstrapOutcome::default();

        for series in result.into_series() {
            if self.state().is_closed() {
                return Err(ShardError::ShardClosed);
            }
            let incoming = match prepare_blocks(&series, block_size) {
                Ok(incoming) => incoming,
                Err(e) => {
                    warn!(shard = self.id, series = %series.id, error = %e, "bootstrap series rejected");
                    outcome.failures.push(EntryFailure::new(series.id, e));
                    continue;
                }
            };
            self.merge_series(&series, &incoming, block_size, buffer_past, &mut outcome)?;
        }

        if !self.transition(ShardState::Bootstrapping, ShardState::Bootstrapped) {
            return Err(ShardError::ShardClosed);
        }
        info!(
            shard = self.id,
            created = outcome.series_created,
            merged = outcome.series_merged,
            blocks_installed = outcome.blocks_installed,
            blocks_merged = outcome.blocks_merged,
            failures = outcome.failures.len(),
            "bootstrap complete"
        );
        Ok(outcome)
    }

    fn merge_series(
        &self,
        series: &SeriesBlocks,
        incoming: &[IncomingBlock],
        block_size: Duration,
        buffer_past: Duration,
        outcome: &mut BootstrapOutcome,
    ) -> Result<()> {
        loop {
            let (entry, created) = self
                .series
                .insert_if_absent(&series.id, |index| self.new_entry(&series.id, &series.tags, index));
            self.release_if_closed(&entry)?;
            let now = self.clock.now();
            match entry.merge_bootstrap(&series.tags, incoming, block_size, buffer_past, now) {
                Ok(Merge::Merged(stats)) => {
                    if created {
                        outcome.series_created += 1;
                    } else {
                        outcome.series_merged += 1;
                    }
                    outcome.blocks_installed += stats.blocks_installed;
                    outcome.blocks_merged += stats.blocks_merged;
                    outcome.points_filled += stats.points_filled;
                    return Ok(());
                }
                Ok(Merge::Retired) => continue,
                Err(e) => {
                    warn!(shard = self.id, series = %series.id, error = %e, "bootstrap merge failed");
                    outcome.failures.push(EntryFailure::new(series.id.clone(), e));
                    return Ok(());
                }
            }
        }
    }
}

/// Validate a series' blocks and decode their points.
///
/// Blocks must be aligned, readable and hold only points inside their own
/// range. Empty blocks are dropped.
fn prepare_blocks(series: &SeriesBlocks, block_size: Duration) -> Result<Vec<IncomingBlock>> {
    if series.id.is_empty() {
        return Err(ShardError::invalid_input("series id must not be empty"));
    }

    let mut incoming = Vec::with_capacity(series.blocks.len());
    for block in &series.blocks {
        let start = block.start();
        if !start.is_aligned(block_size) {
            return Err(ShardError::merge_conflict(
                series.id.clone(),
                format!("block start {} is not aligned to the block size", start),
            ));
        }
        let points = block.decode().map_err(|e| {
            ShardError::merge_conflict(series.id.clone(), format!("block {} unreadable: {}", start, e))
        })?;
        let end = start.saturating_add(block_size);
        if let Some(stray) = points.iter().find(|p| p.timestamp < start || p.timestamp >= end) {
            return Err(ShardError::merge_conflict(
                series.id.clone(),
                format!("point at {} lies outside block {}", stray.timestamp, start),
            ));
        }
        if points.is_empty() {
            continue;
        }
        incoming.push(IncomingBlock {
            block: block.clone(),
            points,
        });
    }
    incoming.sort_by_key(|b| b.block.start());
    Ok(incoming)
}
