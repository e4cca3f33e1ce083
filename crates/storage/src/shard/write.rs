//! Write and read paths

use std::sync::Arc;

use chronoshard_core::{Datapoint, Result, SeriesId, ShardError, Tags, TimeUnit, Timestamp};

use super::Shard;
use crate::entry::Append;

/// Per-write adjustments
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriteOptions {
    /// Store the point at the start of its block instead of its own timestamp
    pub truncate_to_block: bool,
    /// Store this value instead of the supplied one
    pub force_value: Option<f64>,
}

/// Identity of the series a write landed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRef {
    /// Series id
    pub id: SeriesId,
    /// Tags of the entry (fixed at creation)
    pub tags: Tags,
    /// Shard-unique index of the entry
    pub unique_index: u64,
}

/// Result of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Series the point was written to
    pub series: SeriesRef,
    /// `false` if an identical point was already stored
    pub was_written: bool,
}

impl Shard {
    /// Write one datapoint to series `id`, creating the series without tags
    /// if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty id, a non-finite value, a timestamp
    ///   outside the write window, or a rejected duplicate
    /// - `NotBootstrapped` if pre-bootstrap writes are disabled
    /// - `ShardClosed` once the shard is closing
    pub fn write(
        &self,
        id: &SeriesId,
        timestamp: Timestamp,
        value: f64,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        self.write_tagged(id, &Tags::empty(), timestamp, value, unit, annotation, options)
    }

    /// Like [`write`](Self::write), installing `tags` if this write creates
    /// the series. Tags of an existing series are left unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn write_tagged(
        &self,
        id: &SeriesId,
        tags: &Tags,
        timestamp: Timestamp,
        value: f64,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        self.check_writable()?;
        if id.is_empty() {
            return Err(ShardError::invalid_input("series id must not be empty"));
        }
        let value = options.force_value.unwrap_or(value);
        if !value.is_finite() {
            return Err(ShardError::invalid_input(format!(
                "value for series {} is not finite: {}",
                id, value
            )));
        }

        let now = self.clock.now();
        let earliest = now.saturating_sub(self.config.buffer_past());
        let latest = now.saturating_add(self.config.buffer_future());
        if timestamp < earliest || timestamp > latest {
            return Err(ShardError::invalid_input(format!(
                "timestamp {} for series {} is outside the write window [{}, {}]",
                timestamp, id, earliest, latest
            )));
        }

        let block_size = self.config.block_size();
        let timestamp = if options.truncate_to_block {
            timestamp.truncate(block_size)
        } else {
            timestamp
        };
        let point = Datapoint {
            timestamp,
            value,
            unit,
            annotation: annotation.map(Arc::from),
        };

        loop {
            let (entry, _) = self
                .series
                .insert_if_absent(id, |index| self.new_entry(id, tags, index));
            self.release_if_closed(&entry)?;
            let written = match entry.append(
                point.clone(),
                block_size,
                self.config.duplicate_policy,
                now,
            )? {
                Append::Written => true,
                Append::Unchanged => false,
                // Evicted between lookup and append; the map hands out a fresh entry.
                Append::Retired => continue,
            };
            return Ok(WriteOutcome {
                series: SeriesRef {
                    id: entry.id().clone(),
                    tags: entry.tags().clone(),
                    unique_index: entry.unique_index(),
                },
                was_written: written,
            });
        }
    }

    /// Points of series `id` in `[start, end)`, ascending.
    ///
    /// An unknown series reads as empty. Counts as a read for eviction.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `start >= end`, `NotBootstrapped` before bootstrap
    /// completes, `ShardClosed` once closing, `Corruption` if a sealed block
    /// fails its checksum.
    pub fn read(&self, id: &SeriesId, start: Timestamp, end: Timestamp) -> Result<Vec<Datapoint>> {
        self.check_readable()?;
        if start >= end {
            return Err(ShardError::invalid_input(format!(
                "read range start {} must be before end {}",
                start, end
            )));
        }
        let Some(entry) = self.series.lookup(id) else {
            return Ok(Vec::new());
        };
        entry.touch_read(self.clock.now());
        entry.read_range(start, end, self.config.block_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DuplicatePolicy, ShardConfig};
    use crate::shard::BootstrapResult;
    use std::time::Duration;

    fn now() -> Timestamp {
        Timestamp::from_secs(1_000 * 7200 + 3600)
    }

    fn shard_with(config: ShardConfig) -> Shard {
        Shard::builder(0)
            .config(config)
            .clock(Arc::new(ManualClock::with_time(now())))
            .build()
            .unwrap()
    }

    fn shard() -> Shard {
        shard_with(ShardConfig::default())
    }

    fn write(shard: &Shard, id: &str, ts: Timestamp, value: f64) -> Result<WriteOutcome> {
        shard.write(
            &SeriesId::from(id),
            ts,
            value,
            TimeUnit::Second,
            None,
            &WriteOptions::default(),
        )
    }

    #[test]
    fn test_write_creates_series_and_is_visible() {
        let shard = shard();
        let outcome = write(&shard, "foo", now(), 1.5).unwrap();
        assert!(outcome.was_written);
        assert_eq!(outcome.series.id, SeriesId::from("foo"));

        let entry = shard.lookup(&SeriesId::from("foo")).unwrap();
        assert_eq!(entry.point_at(now()).unwrap().unwrap().value, 1.5);
        assert_eq!(entry.unique_index(), outcome.series.unique_index);
    }

    #[test]
    fn test_duplicate_write_is_idempotent() {
        let shard = shard();
        assert!(write(&shard, "foo", now(), 1.0).unwrap().was_written);
        assert!(!write(&shard, "foo", now(), 1.0).unwrap().was_written);

        let entry = shard.lookup(&SeriesId::from("foo")).unwrap();
        assert_eq!(entry.num_blocks(), 1);
        assert_eq!(
            entry.read_range(now(), now().saturating_add(Duration::from_secs(1)), shard.config().block_size())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_reject_policy_keeps_first_value() {
        let shard = shard_with(ShardConfig {
            duplicate_policy: DuplicatePolicy::Reject,
            ..ShardConfig::default()
        });
        write(&shard, "foo", now(), 1.0).unwrap();
        let err = write(&shard, "foo", now(), 2.0).unwrap_err();
        assert!(matches!(err, ShardError::InvalidInput(_)));
    }

    #[test]
    fn test_write_validates_input() {
        let shard = shard();
        assert!(matches!(write(&shard, "", now(), 1.0), Err(ShardError::InvalidInput(_))));
        assert!(matches!(
            write(&shard, "foo", now(), f64::NAN),
            Err(ShardError::InvalidInput(_))
        ));
        assert!(matches!(
            write(&shard, "foo", now(), f64::INFINITY),
            Err(ShardError::InvalidInput(_))
        ));

        let too_old = now().saturating_sub(Duration::from_secs(3600));
        assert!(matches!(write(&shard, "foo", too_old, 1.0), Err(ShardError::InvalidInput(_))));
        let too_new = now().saturating_add(Duration::from_secs(3600));
        assert!(matches!(write(&shard, "foo", too_new, 1.0), Err(ShardError::InvalidInput(_))));

        // Rejected writes leave no trace.
        assert_eq!(shard.num_series(), 0);
    }

    #[test]
    fn test_write_options() {
        let shard = shard();
        let id = SeriesId::from("foo");
        let ts = now().saturating_sub(Duration::from_secs(5));
        let options = WriteOptions {
            truncate_to_block: true,
            force_value: Some(9.0),
        };
        shard
            .write(&id, ts, 1.0, TimeUnit::Millisecond, Some(&b"note"[..]), &options)
            .unwrap();

        let block_start = ts.truncate(shard.config().block_size());
        let point = shard.lookup(&id).unwrap().point_at(block_start).unwrap().unwrap();
        assert_eq!(point.value, 9.0);
        assert_eq!(point.unit, TimeUnit::Millisecond);
        assert_eq!(point.annotation.as_deref(), Some(&b"note"[..]));
    }

    #[test]
    fn test_write_tagged_sets_tags_on_creation_only() {
        let shard = shard();
        let id = SeriesId::from("foo");
        let tags = Tags::new([("host", "a")]);
        let opts = WriteOptions::default();

        let first = shard
            .write_tagged(&id, &tags, now(), 1.0, TimeUnit::Second, None, &opts)
            .unwrap();
        assert_eq!(first.series.tags, tags);

        let other = Tags::new([("host", "b")]);
        let second = shard
            .write_tagged(&id, &other, now(), 2.0, TimeUnit::Second, None, &opts)
            .unwrap();
        assert_eq!(second.series.tags, tags);
    }

    #[test]
    fn test_write_before_bootstrap_policy() {
        let shard = shard();
        assert!(write(&shard, "foo", now(), 1.0).is_ok());

        let strict = shard_with(ShardConfig {
            accept_writes_before_bootstrap: false,
            ..ShardConfig::default()
        });
        assert_eq!(write(&strict, "foo", now(), 1.0), Err(ShardError::NotBootstrapped));
        strict.bootstrap(BootstrapResult::new()).unwrap();
        assert!(write(&strict, "foo", now(), 1.0).is_ok());
    }

    #[test]
    fn test_read_requires_bootstrap_and_valid_range() {
        let shard = shard();
        let id = SeriesId::from("foo");
        write(&shard, "foo", now(), 1.0).unwrap();
        let end = now().saturating_add(Duration::from_secs(1));

        assert_eq!(shard.read(&id, now(), end), Err(ShardError::NotBootstrapped));
        shard.bootstrap(BootstrapResult::new()).unwrap();

        let points = shard.read(&id, now(), end).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(shard.lookup(&id).unwrap().last_read(), now());

        assert!(shard.read(&SeriesId::from("absent"), now(), end).unwrap().is_empty());
        assert!(matches!(shard.read(&id, end, now()), Err(ShardError::InvalidInput(_))));
    }

    #[test]
    fn test_write_after_close_rejected() {
        let shard = shard();
        shard.close().unwrap();
        assert_eq!(write(&shard, "foo", now(), 1.0), Err(ShardError::ShardClosed));
    }
}
