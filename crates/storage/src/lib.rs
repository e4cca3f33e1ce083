//! Shard storage for chronoshard
//!
//! This crate implements the in-memory series shard:
//! - Shard: write, tick, bootstrap and metadata fetch over one keyspace partition
//! - SeriesMap: lock-striped concurrent map with compare-and-remove
//! - SeriesEntry: per-series blocks behind a per-series lock
//! - Blocks: open (mutable) and sealed (encoded, checksummed) time blocks
//! - RuntimeOptionsManager: hot-swappable tick pacing
//! - Collaborators: block flusher, cancellation, clock
//!
//! # Concurrency
//!
//! Every operation may run concurrently with every other one:
//! - Writes only lock the map stripe and the entry they touch
//! - Tick and fetch iterate a weak snapshot, one stripe at a time
//! - Tick evicts by identity, never by id alone, so a concurrent write
//!   can never lose data to an eviction

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod entry;
pub mod flush;
pub mod map;
pub mod runtime;
pub mod shard;

pub use block::{
    BlockMetadata, FetchBlocksMetadataOptions, FlushState, OpenBlock, PointInsert, SealedBlock,
};
pub use cancel::{Cancellable, CancellationToken, NeverCancelled};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DuplicatePolicy, RuntimeConfig, ShardConfig, CONFIG_FILE_NAME};
pub use entry::{SeriesBlock, SeriesEntry};
pub use flush::{BlockFlusher, NoopFlusher, RecordingFlusher};
pub use map::{MapCursor, SeriesIter, SeriesMap};
pub use runtime::{RuntimeOptions, RuntimeOptionsManager};
pub use shard::{
    BootstrapOutcome, BootstrapResult, FetchBlocksMetadataPage, PageToken, SeriesBlocks,
    SeriesBlocksMetadata, SeriesRef, Shard, ShardBuilder, ShardState, TickResult, WriteOptions,
    WriteOutcome,
};

pub use chronoshard_core::{
    Datapoint, EntryFailure, Result, SeriesId, ShardError, Tag, Tags, TimeUnit, Timestamp,
};
