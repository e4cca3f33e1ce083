//! Chronoshard - concurrent in-memory time-series shard
//!
//! A shard owns a partition of the series keyspace and keeps each series'
//! recent data in time-aligned blocks. Writes, maintenance ticks, bulk
//! bootstrap and metadata fetches all run concurrently against one shard.
//!
//! # Quick Start
//!
//! ```ignore
//! use chronoshard::{NeverCancelled, SeriesId, Shard, ShardConfig, TimeUnit, Timestamp, WriteOptions};
//!
//! let shard = Shard::new(0, ShardConfig::default())?;
//! shard.bootstrap(Default::default())?;
//!
//! let id = SeriesId::from("cpu.user");
//! shard.write(&id, Timestamp::now(), 0.25, TimeUnit::Second, None, &WriteOptions::default())?;
//!
//! // Periodically, from a host-owned scheduler:
//! let summary = shard.tick(&NeverCancelled)?;
//! ```
//!
//! # Architecture
//!
//! Value types and errors live in `chronoshard-core`; the shard and its
//! building blocks live in `chronoshard-storage`. This crate re-exports
//! both.

pub use chronoshard_storage::*;
