//! Datapoint and block-boundary time
//!
//! A [`Timestamp`] counts microseconds since the Unix epoch. Block starts
//! are found by truncating to the block width, so alignment is plain
//! integer arithmetic; shifting by a [`Duration`] saturates at either end
//! instead of wrapping.
//!
//! ```
//! use chronoshard_core::Timestamp;
//! use std::time::Duration;
//!
//! let ts = Timestamp::from_secs(7200 * 3 + 125);
//! let block = ts.truncate(Duration::from_secs(7200));
//! assert_eq!(block, Timestamp::from_secs(7200 * 3));
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch; also the initial last-read time of a series
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Wall-clock now, or the epoch if the system clock is set before it
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(elapsed.as_micros() as u64)
    }

    /// From microseconds since the epoch
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// From milliseconds since the epoch, saturating
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    /// From seconds since the epoch, saturating
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// Microseconds since the epoch
    #[inline]
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// `None` when `earlier` is in fact later than `self`
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_micros)
    }

    /// Later by `duration`, saturating at `u64::MAX` microseconds
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as u64))
    }

    /// Earlier by `duration`, saturating at the epoch
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as u64))
    }

    /// Start of the `size`-wide block containing this timestamp. A zero
    /// `size` leaves the timestamp unchanged.
    pub fn truncate(&self, size: Duration) -> Self {
        let size = size.as_micros() as u64;
        if size == 0 {
            return *self;
        }
        Timestamp(self.0 - self.0 % size)
    }

    /// Whether this is the start of a `size`-wide block
    pub fn is_aligned(&self, size: Duration) -> bool {
        self.truncate(size) == *self
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::EPOCH
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}
