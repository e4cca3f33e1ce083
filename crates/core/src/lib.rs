//! Core types for chronoshard
//!
//! This crate defines the foundational types used throughout the system:
//! - SeriesId / Tags: identity of a time series
//! - Timestamp: microsecond-precision point in time
//! - TimeUnit / Datapoint: a single sample and its precision
//! - ShardError: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod timestamp;
pub mod types;

pub use error::{EntryFailure, Result, ShardError};
pub use timestamp::Timestamp;
pub use types::{Datapoint, SeriesId, Tag, Tags, TimeUnit};
