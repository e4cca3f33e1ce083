//! Cooperative cancellation for long iterations
//!
//! Tick and metadata fetches poll a [`Cancellable`] at batch boundaries and
//! stop with [`ShardError::Cancelled`](chronoshard_core::ShardError::Cancelled)
//! once it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Something a long-running iteration can poll for cancellation
pub trait Cancellable: Send + Sync {
    /// Whether the caller asked to stop
    fn is_cancelled(&self) -> bool;
}

/// Never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancelled;

impl Cancellable for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared cancellation flag
///
/// Clones observe the same flag, so the caller keeps one clone and hands
/// another to the operation.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// New, not yet cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Cancellable for CancellationToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
