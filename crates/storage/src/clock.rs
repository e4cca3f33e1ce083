//! Time source for a shard
//!
//! Write windows, sealing, expiry and idle eviction all depend on "now".
//! The shard reads it through [`Clock`] so tests can drive time explicitly.

use std::time::Duration;

use chronoshard_core::Timestamp;
use parking_lot::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<Timestamp>,
}

impl ManualClock {
    /// Clock frozen at `time`
    pub fn with_time(time: Timestamp) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Clock frozen at the current wall-clock time
    pub fn new() -> Self {
        Self::with_time(Timestamp::now())
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now = now.saturating_add(duration);
    }

    /// Jump to an absolute time
    pub fn set_time(&self, time: Timestamp) {
        *self.now.write() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_only_on_request() {
        let clock = ManualClock::with_time(Timestamp::from_secs(100));
        assert_eq!(clock.now(), Timestamp::from_secs(100));

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Timestamp::from_secs(105));

        clock.set_time(Timestamp::from_secs(1));
        assert_eq!(clock.now(), Timestamp::from_secs(1));
    }
}
