//! In-memory state of one time series
//!
//! A [`SeriesEntry`] owns the blocks of a single series behind its own
//! lock. Every mutation (write append, tick sealing/expiry, bootstrap
//! merge) runs inside that lock, so operations on one series are
//! linearizable while different series never contend.
//!
//! # Retirement
//!
//! Tick evicts an empty, idle entry by first marking it retired while
//! holding the entry lock, then removing it from the series map with a
//! compare-and-remove. Writers and bootstrap check the mark under the same
//! lock; on seeing it they go back to the map, which hands out a fresh
//! entry. A retired entry never accepts data again, so nothing written to
//! it can be lost by the eviction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chronoshard_core::{Datapoint, Result, SeriesId, ShardError, Tags, Timestamp};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::warn;

use crate::block::{
    BlockMetadata, FetchBlocksMetadataOptions, OpenBlock, PointInsert, SealedBlock,
};
use crate::config::DuplicatePolicy;
use crate::flush::BlockFlusher;

/// A block as held by an entry
#[derive(Debug, Clone)]
pub enum SeriesBlock {
    /// Still accepting writes
    Open(OpenBlock),
    /// Immutable, pending flush or flushed
    Sealed(SealedBlock),
}

impl SeriesBlock {
    /// Block start
    pub fn start(&self) -> Timestamp {
        match self {
            SeriesBlock::Open(block) => block.start(),
            SeriesBlock::Sealed(block) => block.start(),
        }
    }

    /// Whether the block is sealed
    pub fn is_sealed(&self) -> bool {
        matches!(self, SeriesBlock::Sealed(_))
    }
}

/// Outcome of appending a point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Append {
    Written,
    Unchanged,
    /// Entry was evicted; the caller must resolve the id again
    Retired,
}

/// Bootstrap block after validation, with its points decoded once
#[derive(Debug, Clone)]
pub(crate) struct IncomingBlock {
    pub block: SealedBlock,
    pub points: Vec<Datapoint>,
}

/// What a bootstrap merge did to one entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MergeStats {
    pub blocks_installed: usize,
    pub blocks_merged: usize,
    pub points_filled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Merge {
    Merged(MergeStats),
    Retired,
}

/// Inputs of one entry's tick, fixed for a batch
pub(crate) struct TickContext<'a> {
    pub now: Timestamp,
    pub block_size: Duration,
    pub buffer_past: Duration,
    pub retention: Duration,
    pub idle_window: Duration,
    /// Expiry and eviction only run once the shard is bootstrapped
    pub expire: bool,
    pub flusher: &'a dyn BlockFlusher,
}

/// What one entry's tick did
#[derive(Debug, Default)]
pub(crate) struct EntryTick {
    pub newly_sealed: usize,
    pub flushed: usize,
    pub expired_blocks: usize,
    pub open_blocks: usize,
    pub sealed_blocks: usize,
    pub failures: SmallVec<[ShardError; 1]>,
    pub retired: bool,
}

/// One time series' in-memory state
#[derive(Debug)]
pub struct SeriesEntry {
    id: SeriesId,
    tags: Tags,
    unique_index: u64,
    blocks: RwLock<BTreeMap<Timestamp, SeriesBlock>>,
    /// Only ever set while holding the `blocks` write lock
    retired: AtomicBool,
    last_write: AtomicU64,
    last_read: AtomicU64,
}

impl SeriesEntry {
    /// Create an empty entry.
    ///
    /// `created_at` counts as the last write so that a fresh entry is not
    /// considered idle before anything had a chance to write to it.
    pub fn new(id: SeriesId, tags: Tags, unique_index: u64, created_at: Timestamp) -> Self {
        Self {
            id,
            tags,
            unique_index,
            blocks: RwLock::new(BTreeMap::new()),
            retired: AtomicBool::new(false),
            last_write: AtomicU64::new(created_at.as_micros()),
            last_read: AtomicU64::new(0),
        }
    }

    /// Series id
    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    /// Series tags
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Shard-unique index assigned when the entry was created
    pub fn unique_index(&self) -> u64 {
        self.unique_index
    }

    /// Last write (or creation) time
    pub fn last_write(&self) -> Timestamp {
        Timestamp::from_micros(self.last_write.load(Ordering::Acquire))
    }

    /// Last read time, epoch if never read
    pub fn last_read(&self) -> Timestamp {
        Timestamp::from_micros(self.last_read.load(Ordering::Acquire))
    }

    /// Record a read at `now`
    pub fn touch_read(&self, now: Timestamp) {
        self.last_read.fetch_max(now.as_micros(), Ordering::AcqRel);
    }

    /// Whether tick evicted this entry
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Number of blocks held
    pub fn num_blocks(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether the entry holds no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Starts of all held blocks with their sealed flag, ascending
    pub fn block_starts(&self) -> Vec<(Timestamp, bool)> {
        self.blocks
            .read()
            .values()
            .map(|block| (block.start(), block.is_sealed()))
            .collect()
    }

    /// Point stored at exactly `timestamp`
    pub fn point_at(&self, timestamp: Timestamp) -> Result<Option<Datapoint>> {
        let blocks = self.blocks.read();
        let Some((_, block)) = blocks.range(..=timestamp).next_back() else {
            return Ok(None);
        };
        match block {
            SeriesBlock::Open(open) => Ok(open.get(timestamp).cloned()),
            SeriesBlock::Sealed(sealed) => Ok(sealed
                .decode()?
                .into_iter()
                .find(|p| p.timestamp == timestamp)),
        }
    }

    /// Points in `[start, end)`, ascending
    pub fn read_range(
        &self,
        start: Timestamp,
        end: Timestamp,
        block_size: Duration,
    ) -> Result<Vec<Datapoint>> {
        let mut points = Vec::new();
        if start >= end {
            return Ok(points);
        }
        let blocks = self.blocks.read();
        for block in blocks.range(start.truncate(block_size)..end).map(|(_, b)| b) {
            match block {
                SeriesBlock::Open(open) => points.extend(open.range(start, end).cloned()),
                SeriesBlock::Sealed(sealed) => points.extend(
                    sealed
                        .decode()?
                        .into_iter()
                        .filter(|p| p.timestamp >= start && p.timestamp < end),
                ),
            }
        }
        Ok(points)
    }

    /// Metadata of blocks intersecting `[start, end)`
    pub fn blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
        block_size: Duration,
        options: &FetchBlocksMetadataOptions,
    ) -> Vec<BlockMetadata> {
        if start >= end {
            return Vec::new();
        }
        let last_read = options.include_last_read.then(|| self.last_read());
        let blocks = self.blocks.read();
        blocks
            .range(start.truncate(block_size)..end)
            .map(|(block_start, block)| {
                let (size, checksum) = match block {
                    SeriesBlock::Sealed(sealed) => (sealed.size() as u64, sealed.checksum()),
                    SeriesBlock::Open(open) => {
                        let data = open.encode();
                        (data.len() as u64, crc32fast::hash(&data))
                    }
                };
                BlockMetadata {
                    start: *block_start,
                    size: options.include_sizes.then_some(size),
                    checksum: options.include_checksums.then_some(checksum),
                    last_read,
                    sealed: block.is_sealed(),
                }
            })
            .collect()
    }

    /// Append a point to the open block covering its timestamp.
    pub(crate) fn append(
        &self,
        point: Datapoint,
        block_size: Duration,
        policy: DuplicatePolicy,
        now: Timestamp,
    ) -> Result<Append> {
        let start = point.timestamp.truncate(block_size);
        let timestamp = point.timestamp;

        let mut blocks = self.blocks.write();
        if self.is_retired() {
            return Ok(Append::Retired);
        }

        let block = blocks
            .entry(start)
            .or_insert_with(|| SeriesBlock::Open(OpenBlock::new(start)));
        let inserted = match block {
            SeriesBlock::Open(open) => {
                open.insert(point, policy == DuplicatePolicy::LastWriteWins)
            }
            SeriesBlock::Sealed(_) => {
                return Err(ShardError::invalid_input(format!(
                    "block {} of series {} is already sealed",
                    start, self.id
                )));
            }
        };

        match inserted {
            PointInsert::Conflict => Err(ShardError::invalid_input(format!(
                "series {} already holds a different value at {}",
                self.id, timestamp
            ))),
            PointInsert::Unchanged => {
                self.last_write.fetch_max(now.as_micros(), Ordering::AcqRel);
                Ok(Append::Unchanged)
            }
            PointInsert::Inserted | PointInsert::Replaced => {
                self.last_write.fetch_max(now.as_micros(), Ordering::AcqRel);
                Ok(Append::Written)
            }
        }
    }

    /// Merge bootstrapped blocks into this entry. Live data wins on overlap.
    ///
    /// Runs entirely under the entry lock: a concurrent tick of this entry
    /// observes either none or all of the merge.
    pub(crate) fn merge_bootstrap(
        &self,
        tags: &Tags,
        incoming: &[IncomingBlock],
        block_size: Duration,
        buffer_past: Duration,
        now: Timestamp,
    ) -> Result<Merge> {
        if !self.tags.is_empty() && !tags.is_empty() && self.tags != *tags {
            return Err(ShardError::merge_conflict(
                self.id.clone(),
                "bootstrap tags differ from live tags",
            ));
        }

        let mut blocks = self.blocks.write();
        if self.is_retired() {
            return Ok(Merge::Retired);
        }

        let seal_before = now.saturating_sub(buffer_past);
        let mut stats = MergeStats::default();
        for block in incoming {
            let start = block.block.start();
            match blocks.get_mut(&start) {
                None => {
                    let writable = start.saturating_add(block_size) > seal_before;
                    let installed = if writable {
                        SeriesBlock::Open(OpenBlock::from_points(start, block.points.clone()))
                    } else {
                        SeriesBlock::Sealed(block.block.clone())
                    };
                    blocks.insert(start, installed);
                    stats.blocks_installed += 1;
                }
                Some(SeriesBlock::Open(open)) => {
                    let filled = block
                        .points
                        .iter()
                        .filter(|p| open.fill((*p).clone()))
                        .count();
                    stats.points_filled += filled;
                    stats.blocks_merged += 1;
                }
                Some(SeriesBlock::Sealed(existing)) => {
                    let live = existing.decode().map_err(|e| {
                        ShardError::merge_conflict(
                            self.id.clone(),
                            format!("live block {} unreadable: {}", start, e),
                        )
                    })?;
                    let mut merged: BTreeMap<Timestamp, Datapoint> =
                        live.into_iter().map(|p| (p.timestamp, p)).collect();
                    let before = merged.len();
                    for point in &block.points {
                        merged
                            .entry(point.timestamp)
                            .or_insert_with(|| point.clone());
                    }
                    let filled = merged.len() - before;
                    if filled > 0 {
                        // Sealed bytes are never rewritten; the merged block replaces them.
                        let points: Vec<Datapoint> = merged.into_values().collect();
                        *existing = SealedBlock::encode(start, &points);
                    }
                    stats.points_filled += filled;
                    stats.blocks_merged += 1;
                }
            }
        }
        Ok(Merge::Merged(stats))
    }

    /// Seal, flush, expire and possibly retire this entry.
    ///
    /// The flusher is called without holding the entry lock; a block is
    /// only marked flushed if it was not replaced in the meantime. Expiry
    /// runs after the flush handoff and never drops a sealed block the
    /// flusher has not accepted, so an entry holding unflushed data is
    /// never retired.
    pub(crate) fn tick(&self, ctx: &TickContext<'_>) -> EntryTick {
        let mut report = EntryTick::default();
        let seal_before = ctx.now.saturating_sub(ctx.buffer_past);

        let pending: SmallVec<[SealedBlock; 2]> = {
            let mut blocks = self.blocks.write();
            if self.is_retired() {
                return report;
            }

            let to_seal: SmallVec<[Timestamp; 2]> = blocks
                .iter()
                .filter(|(start, block)| {
                    !block.is_sealed() && start.saturating_add(ctx.block_size) <= seal_before
                })
                .map(|(start, _)| *start)
                .collect();
            for start in to_seal {
                if let Some(SeriesBlock::Open(open)) = blocks.remove(&start) {
                    blocks.insert(start, SeriesBlock::Sealed(open.seal()));
                    report.newly_sealed += 1;
                }
            }

            blocks
                .values()
                .filter_map(|block| match block {
                    SeriesBlock::Sealed(sealed) if !sealed.is_flushed() => Some(sealed.clone()),
                    _ => None,
                })
                .collect()
        };

        let mut accepted: SmallVec<[SealedBlock; 2]> = SmallVec::new();
        for block in pending {
            match ctx.flusher.on_block_sealed(&self.id, &block) {
                Ok(()) => accepted.push(block),
                Err(e) => {
                    warn!(series = %self.id, block = %block.start(), error = %e, "block flush failed");
                    report.failures.push(e);
                }
            }
        }

        let mut blocks = self.blocks.write();
        for block in accepted {
            if let Some(SeriesBlock::Sealed(stored)) = blocks.get_mut(&block.start()) {
                if stored.same_data(&block) {
                    stored.mark_flushed();
                    report.flushed += 1;
                }
            }
        }

        if ctx.expire {
            let id = &self.id;
            let before = blocks.len();
            blocks.retain(|start, block| {
                let expires_at = start
                    .saturating_add(ctx.block_size)
                    .saturating_add(ctx.retention);
                if expires_at > ctx.now {
                    return true;
                }
                match block {
                    SeriesBlock::Sealed(sealed) if sealed.is_flushed() => false,
                    _ => {
                        warn!(series = %id, block = %start, "keeping expired block until it is flushed");
                        true
                    }
                }
            });
            report.expired_blocks = before - blocks.len();
        }

        for block in blocks.values() {
            if block.is_sealed() {
                report.sealed_blocks += 1;
            } else {
                report.open_blocks += 1;
            }
        }

        if ctx.expire && blocks.is_empty() && self.is_idle(ctx.now, ctx.idle_window) {
            self.retired.store(true, Ordering::Release);
            report.retired = true;
        }
        report
    }

    fn is_idle(&self, now: Timestamp, window: Duration) -> bool {
        let last_active = self.last_write().max(self.last_read());
        match now.duration_since(last_active) {
            Some(elapsed) => elapsed >= window,
            None => false,
        }
    }
}
