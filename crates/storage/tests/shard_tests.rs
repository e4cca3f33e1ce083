//! End-to-end tests for the shard lifecycle
//!
//! Each test drives a shard through the public API only: configuration
//! from `shard.toml`, writes before and after bootstrap, ticks that seal
//! and flush, paged fetches and close.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chronoshard_storage::{
    BootstrapResult, CancellationToken, Clock, Datapoint, DuplicatePolicy, FetchBlocksMetadataOptions,
    FlushState, ManualClock, NeverCancelled, RecordingFlusher, SealedBlock, SeriesBlocks,
    SeriesId, Shard, ShardConfig, ShardError, ShardState, Tags, TimeUnit, Timestamp,
    WriteOptions, CONFIG_FILE_NAME,
};
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);
const BLOCK: Duration = Duration::from_secs(2 * 3600);

fn now() -> Timestamp {
    Timestamp::from_secs(1_000 * 7200 + 3600)
}

struct Env {
    shard: Arc<Shard>,
    clock: Arc<ManualClock>,
    flusher: Arc<RecordingFlusher>,
}

fn env(config: ShardConfig) -> Env {
    let clock = Arc::new(ManualClock::with_time(now()));
    let flusher = Arc::new(RecordingFlusher::new());
    let shard = Shard::builder(7)
        .config(config)
        .clock(clock.clone())
        .flusher(flusher.clone())
        .build()
        .unwrap();
    Env {
        shard: Arc::new(shard),
        clock,
        flusher,
    }
}

fn write(shard: &Shard, id: &str, ts: Timestamp, value: f64) -> chronoshard_storage::Result<bool> {
    shard
        .write(
            &SeriesId::from(id),
            ts,
            value,
            TimeUnit::Second,
            None,
            &WriteOptions::default(),
        )
        .map(|outcome| outcome.was_written)
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_shard_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        "duplicate_policy = \"reject\"\nmap_buckets = 4\n[runtime]\ntick_series_batch_size = 3\n",
    )
    .unwrap();

    let config = ShardConfig::from_file(&path).unwrap();
    let env = env(config);
    assert_eq!(env.shard.config().duplicate_policy, DuplicatePolicy::Reject);
    assert_eq!(env.shard.runtime_options().tick_series_batch_size, 3);

    write(&env.shard, "foo", now(), 1.0).unwrap();
    let err = write(&env.shard, "foo", now(), 2.0).unwrap_err();
    assert!(matches!(err, ShardError::InvalidInput(_)));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_full_lifecycle() {
    let env = env(ShardConfig::default());
    assert_eq!(env.shard.state(), ShardState::Initializing);

    // Writes before bootstrap are buffered in the live entry.
    assert_eq!(write(&env.shard, "cpu", now(), 0.5), Ok(true));

    let old = now().truncate(BLOCK).saturating_sub(BLOCK * 3);
    let history = SealedBlock::encode(old, &[Datapoint::new(old, 0.1, TimeUnit::Second)]);
    let result: BootstrapResult = std::iter::once(
        SeriesBlocks::new(SeriesId::from("cpu"), Tags::new([("host", "a")])).with_block(history),
    )
    .collect();
    let outcome = env.shard.bootstrap(result).unwrap();
    assert_eq!(outcome.series_merged, 1);
    assert_eq!(outcome.blocks_installed, 1);
    assert_eq!(env.shard.state(), ShardState::Bootstrapped);

    let points = env
        .shard
        .read(&SeriesId::from("cpu"), old, now().saturating_add(HOUR))
        .unwrap();
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![0.1, 0.5]);

    // Move past the live block's write window: tick seals and flushes it,
    // and offers the bootstrapped block too since it arrived pending.
    env.clock.advance(2 * HOUR);
    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.newly_sealed_blocks, 1);
    assert_eq!(tick.flushed_blocks, 2);
    assert_eq!(tick.sealed_blocks, 2);
    assert_eq!(env.flusher.len(), 2);
    assert_eq!(env.shard.tick_count(), 1);

    let entry = env.shard.lookup(&SeriesId::from("cpu")).unwrap();
    assert!(entry.block_starts().iter().all(|(_, sealed)| *sealed));

    let page = env
        .shard
        .fetch_blocks_metadata(
            old,
            env.clock.now(),
            10,
            None,
            FetchBlocksMetadataOptions::all(),
            &NeverCancelled,
        )
        .unwrap();
    assert_eq!(page.series.len(), 1);
    assert_eq!(page.series[0].blocks.len(), 2);
    assert!(page.series[0].blocks.iter().all(|b| b.sealed && b.size.is_some()));

    env.shard.close().unwrap();
    assert_eq!(env.shard.state(), ShardState::Closed);
    assert!(env.shard.lookup(&SeriesId::from("cpu")).is_none());
    assert_eq!(env.shard.tick(&NeverCancelled), Err(ShardError::ShardClosed));
}

#[test]
fn test_retention_evicts_idle_series() {
    let env = env(ShardConfig::default());
    env.shard.bootstrap(BootstrapResult::new()).unwrap();
    write(&env.shard, "short-lived", now(), 1.0).unwrap();
    write(&env.shard, "steady", now(), 1.0).unwrap();

    env.clock.advance(52 * HOUR);
    let later = now().saturating_add(52 * HOUR);
    write(&env.shard, "steady", later, 2.0).unwrap();

    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.expired_series, 1);
    assert_eq!(tick.active_series, 1);
    assert!(env.shard.lookup(&SeriesId::from("short-lived")).is_none());
    assert!(env.shard.lookup(&SeriesId::from("steady")).is_some());
    assert_eq!(env.shard.num_series(), 1);
}

#[test]
fn test_unflushed_series_survives_retention() {
    let env = env(ShardConfig::default());
    env.shard.bootstrap(BootstrapResult::new()).unwrap();
    write(&env.shard, "foo", now(), 1.0).unwrap();
    env.flusher.set_failing(true);

    env.clock.advance(2 * HOUR);
    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.newly_sealed_blocks, 1);
    assert_eq!(tick.errors.len(), 1);

    env.clock.advance(50 * HOUR);
    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.errors.len(), 1);
    assert_eq!(tick.expired_blocks, 0);
    assert_eq!(tick.expired_series, 0);
    assert_eq!(tick.sealed_blocks, 1);
    let entry = env.shard.lookup(&SeriesId::from("foo")).unwrap();
    assert_eq!(entry.point_at(now()).unwrap().unwrap().value, 1.0);

    env.flusher.set_failing(false);
    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.flushed_blocks, 1);
    assert_eq!(env.flusher.flushed()[0].1, now().truncate(BLOCK));
    assert_eq!(tick.expired_blocks, 1);
    assert_eq!(tick.expired_series, 1);
    assert!(env.shard.lookup(&SeriesId::from("foo")).is_none());
}

#[test]
fn test_block_sealed_after_retention_reaches_flusher() {
    let env = env(ShardConfig::default());
    env.shard.bootstrap(BootstrapResult::new()).unwrap();
    write(&env.shard, "foo", now(), 1.0).unwrap();

    env.clock.advance(60 * HOUR);
    let tick = env.shard.tick(&NeverCancelled).unwrap();
    assert_eq!(tick.newly_sealed_blocks, 1);
    assert_eq!(tick.flushed_blocks, 1);
    assert_eq!(env.flusher.len(), 1);
    assert_eq!(tick.expired_series, 1);
}

#[test]
fn test_sealed_blocks_are_immutable() {
    let env = env(ShardConfig::default());
    env.shard.bootstrap(BootstrapResult::new()).unwrap();
    write(&env.shard, "foo", now(), 1.0).unwrap();

    env.clock.advance(2 * HOUR);
    env.shard.tick(&NeverCancelled).unwrap();
    let entry = env.shard.lookup(&SeriesId::from("foo")).unwrap();
    let before = entry.blocks_metadata(
        now().truncate(BLOCK),
        now().saturating_add(HOUR),
        BLOCK,
        &FetchBlocksMetadataOptions::all(),
    );

    // The sealed range is now outside the write window.
    let err = write(&env.shard, "foo", now(), 5.0).unwrap_err();
    assert!(matches!(err, ShardError::InvalidInput(_)));

    let after = entry.blocks_metadata(
        now().truncate(BLOCK),
        now().saturating_add(HOUR),
        BLOCK,
        &FetchBlocksMetadataOptions::all(),
    );
    assert_eq!(before[0].checksum, after[0].checksum);
    assert_eq!(before[0].size, after[0].size);
}

#[test]
fn test_bootstrap_block_states() {
    let data = chronoshard_storage::block::encode_points(&[Datapoint::new(
        Timestamp::EPOCH,
        1.0,
        TimeUnit::Second,
    )]);
    let checksum = crc32fast::hash(&data);
    let loaded = SealedBlock::from_encoded(Timestamp::EPOCH, data, checksum).unwrap();
    assert_eq!(loaded.flush_state(), FlushState::Flushed);

    let fresh = SealedBlock::encode(Timestamp::EPOCH, &[]);
    assert_eq!(fresh.flush_state(), FlushState::Pending);
}

// ============================================================================
// Cross-thread visibility and cancellation
// ============================================================================

#[test]
fn test_write_visible_from_other_thread() {
    let env = env(ShardConfig::default());
    let shard = Arc::clone(&env.shard);
    let writer = thread::spawn(move || write(&shard, "foo", now(), 3.25));
    assert_eq!(writer.join().unwrap(), Ok(true));

    let entry = env.shard.lookup(&SeriesId::from("foo")).unwrap();
    assert_eq!(entry.point_at(now()).unwrap().unwrap().value, 3.25);
}

#[test]
fn test_cancelled_fetch_and_tick() {
    let env = env(ShardConfig::default());
    for i in 0..10 {
        write(&env.shard, &format!("foo.{}", i), now(), 1.0).unwrap();
    }
    env.shard.bootstrap(BootstrapResult::new()).unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    cancel.cancel();

    assert_eq!(env.shard.tick(&token), Err(ShardError::Cancelled));
    let err = env
        .shard
        .fetch_blocks_metadata(
            now().saturating_sub(HOUR),
            now().saturating_add(HOUR),
            5,
            None,
            FetchBlocksMetadataOptions::default(),
            &token,
        )
        .unwrap_err();
    assert_eq!(err, ShardError::Cancelled);

    // Nothing was evicted or altered by the aborted passes.
    assert_eq!(env.shard.num_series(), 10);
    assert_eq!(env.shard.tick_count(), 0);
}
