//! Error types for shard operations
//!
//! Every shard operation reports failure through [`ShardError`]; nothing in
//! the storage path is allowed to panic on a caller's behalf.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! # Taxonomy
//!
//! - **InvalidInput**: malformed caller arguments, fails fast with no state change
//! - **NotBootstrapped**: shard is not ready for the requested operation
//! - **PartialFailure**: some entries of a tick/bootstrap pass failed
//! - **Cancelled**: caller aborted a long iteration
//! - **ShardClosed**: shard is shutting down or shut down

use crate::types::SeriesId;
use thiserror::Error;

/// Result type alias for shard operations
pub type Result<T> = std::result::Result<T, ShardError>;

/// Error types for shard operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShardError {
    /// Malformed caller arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Shard has not finished bootstrapping
    #[error("Shard is not bootstrapped")]
    NotBootstrapped,

    /// Bootstrap was requested after a bootstrap already started or finished
    #[error("Shard is already bootstrapped")]
    AlreadyBootstrapped,

    /// Shard is closing or closed
    #[error("Shard is closed")]
    ShardClosed,

    /// Bootstrap data for a series could not be merged into its entry
    #[error("Merge conflict for series {id}: {reason}")]
    MergeConflict {
        /// Series whose merge failed
        id: SeriesId,
        /// Why the merge failed
        reason: String,
    },

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Another tick pass is already running on this shard
    #[error("Tick already in progress")]
    TickInProgress,

    /// One or more entries of an aggregate pass failed
    #[error("{} series failed", failed.len())]
    PartialFailure {
        /// Per-entry failures
        failed: Vec<EntryFailure>,
    },

    /// The flush collaborator rejected a sealed block
    #[error("Flush error: {0}")]
    Flush(String),

    /// Encoded block data failed validation
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardError {
    /// Create an InvalidInput error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ShardError::InvalidInput(msg.into())
    }

    /// Create a MergeConflict error
    pub fn merge_conflict(id: SeriesId, reason: impl Into<String>) -> Self {
        ShardError::MergeConflict {
            id,
            reason: reason.into(),
        }
    }

    /// Create a Corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        ShardError::Corruption(msg.into())
    }

    /// Create a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        ShardError::Config(msg.into())
    }

    /// Whether the shard simply is not ready yet.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ShardError::NotBootstrapped)
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Closed shards and malformed input never become valid by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardError::NotBootstrapped | ShardError::TickInProgress | ShardError::Flush(_)
        )
    }
}

/// A failure attributed to a single series during an aggregate pass
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFailure {
    /// Series that failed
    pub id: SeriesId,
    /// What went wrong
    pub error: ShardError,
}

impl EntryFailure {
    /// Create a new entry failure
    pub fn new(id: SeriesId, error: ShardError) -> Self {
        Self { id, error }
    }
}
