// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures without panics,
//! deadlocks, lost checkpoints or checkpoints that run ahead of delivery.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{records, MemorySource, RecordingCheckpointer, Reply, ScriptedSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_replicator::resilience::RecordingSleeper;
use stream_replicator::{
    CheckpointStore, EngineState, FlushThresholds, InitialPosition, LeaseManager, Position, ReplicationEngine,
    ReplicatorConfig, RetryConfig, ShardWorker, StaticLeaseManager, StoreCheckpointer, WorkerFactory, WorkerState,
};
use tempfile::tempdir;

fn config() -> ReplicatorConfig {
    let mut config = ReplicatorConfig::for_testing("chaos");
    config.input.initial_position = InitialPosition::TrimHorizon;
    config.input.max_records_per_fetch = 5;
    config
}

async fn wait_for_checkpoint(store: &CheckpointStore, shard_id: &str, position: Position, within: Duration) {
    tokio::time::timeout(within, async {
        while store.get(shard_id).await != Some(position) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("checkpoint not reached in time");
}

// =============================================================================
// Sink Failures
// =============================================================================

/// Test: Flapping transport eventually delivers every record exactly once
#[tokio::test]
async fn transport_flapping_delivers_everything() {
    let mut script = Vec::new();
    for i in 0..30 {
        if i % 3 == 0 {
            script.push(Reply::Accept);
        } else {
            script.push(Reply::Transport(format!("flap {}", i)));
        }
    }
    let sink = Arc::new(ScriptedSink::with_script(script));
    let sleeper = Arc::new(RecordingSleeper::new());
    let mut worker = ShardWorker::new(
        "shard-0001",
        Arc::clone(&sink),
        FlushThresholds::new(4, 1024 * 1024),
        RetryConfig::default(),
        sleeper.clone(),
    );
    worker.initialize("shard-0001").unwrap();
    let checkpointer = RecordingCheckpointer::watching(Arc::clone(&sink));

    worker.on_records(records(1..=20), &checkpointer).await.unwrap();

    let accepted = sink.accepted();
    assert_eq!(accepted.len(), 20, "a transport failure must not half-deliver a batch");
    assert_eq!(sink.accepted_set().len(), 20);
    assert_eq!(
        checkpointer.written(),
        vec![Position(4), Position(8), Position(12), Position(16), Position(20)]
    );
    println!("Delivered after {} backoffs", sleeper.delays().len());
}

/// Test: A write that never answers is abandoned at the request timeout and retried
#[tokio::test]
async fn hung_write_times_out_and_retries() {
    let sink = Arc::new(ScriptedSink::with_script(vec![Reply::Hang, Reply::Accept]));
    let sleeper = Arc::new(RecordingSleeper::new());
    let retry = RetryConfig {
        request_timeout: Duration::from_millis(50),
        ..RetryConfig::default()
    };
    let mut worker = ShardWorker::new(
        "shard-0001",
        Arc::clone(&sink),
        FlushThresholds::new(3, 1024 * 1024),
        retry,
        sleeper.clone(),
    );
    worker.initialize("shard-0001").unwrap();
    let checkpointer = RecordingCheckpointer::new();

    let start = Instant::now();
    worker.on_records(records(1..=3), &checkpointer).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(sink.call_count(), 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_millis(100)]);
    assert_eq!(checkpointer.written(), vec![Position(3)]);
}

/// Test: Sustained rejection of one entry never blocks the rest of the batch
#[tokio::test]
async fn poison_entry_retried_until_accepted() {
    let mut script = vec![Reply::Reject(vec![2])];
    script.extend(std::iter::repeat(Reply::Reject(vec![0])).take(20));
    let sink = Arc::new(ScriptedSink::with_script(script));
    let sleeper = Arc::new(RecordingSleeper::new());
    let mut worker = ShardWorker::new(
        "shard-0001",
        Arc::clone(&sink),
        FlushThresholds::new(5, 1024 * 1024),
        RetryConfig::default(),
        sleeper.clone(),
    );
    worker.initialize("shard-0001").unwrap();
    let checkpointer = RecordingCheckpointer::watching(Arc::clone(&sink));

    worker.on_records(records(1..=5), &checkpointer).await.unwrap();

    assert_eq!(sink.call_count(), 22);
    assert!(sink.calls()[1..].iter().all(|call| call == &vec![Position(3)]));
    assert_eq!(sleeper.delays().iter().filter(|d| **d == Duration::from_millis(6400)).count(), 15);
    assert_eq!(checkpointer.written(), vec![Position(5)]);
}

// =============================================================================
// Lease and Checkpoint Store Failures
// =============================================================================

/// Test: A lease stolen between flushes stops checkpointing at the last owned position
#[tokio::test]
async fn lease_stolen_between_flushes() {
    let dir = tempdir().unwrap();
    let store = Arc::new(
        CheckpointStore::open(dir.path().join("checkpoints.db"), "chaos")
            .await
            .unwrap(),
    );
    let leases = Arc::new(StaticLeaseManager::new());
    assert!(leases.assign("shard-0001", "worker-a").await);

    let sink = Arc::new(ScriptedSink::new());
    let mut worker = ShardWorker::new(
        "shard-0001",
        Arc::clone(&sink),
        FlushThresholds::new(3, 1024 * 1024),
        RetryConfig::default(),
        Arc::new(RecordingSleeper::new()),
    );
    worker.initialize("shard-0001").unwrap();
    let checkpointer = StoreCheckpointer::new(
        Arc::clone(&store),
        Arc::clone(&leases),
        "shard-0001",
        "worker-a",
        worker.shutdown_handle().subscribe(),
    );

    worker.on_records(records(1..=3), &checkpointer).await.unwrap();
    assert_eq!(store.get("shard-0001").await, Some(Position(3)));

    leases.force_assign("shard-0001", "worker-b").await;
    let err = worker.on_records(records(4..=6), &checkpointer).await.unwrap_err();

    assert!(err.is_lease_lost());
    assert_eq!(worker.state(), WorkerState::Failed);
    assert_eq!(store.get("shard-0001").await, Some(Position(3)));
    assert_eq!(store.entry("shard-0001").await.unwrap().owner, "worker-a");
}

/// Test: Checkpoints survive a crash and never move backward
#[tokio::test]
async fn checkpoint_crash_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("checkpoints.db");

    // Phase 1: write and drop without closing (simulates a crash)
    {
        let store = CheckpointStore::open(&db_path, "chaos").await.unwrap();
        assert!(store.put("shard-0001", Position(10), "worker-a").await.unwrap());
        assert!(store.put("shard-0001", Position(20), "worker-a").await.unwrap());
        assert!(store.put("shard-0002", Position(7), "worker-a").await.unwrap());
    }

    // Phase 2: recover
    {
        let store = CheckpointStore::open(&db_path, "chaos").await.unwrap();
        assert_eq!(store.get("shard-0001").await, Some(Position(20)));
        assert_eq!(store.get("shard-0002").await, Some(Position(7)));

        assert!(!store.put("shard-0001", Position(15), "worker-b").await.unwrap());
        assert_eq!(store.get("shard-0001").await, Some(Position(20)));
        store.close().await;
    }

    // Another application sharing the file sees nothing.
    let other = CheckpointStore::open(&db_path, "other-app").await.unwrap();
    assert_eq!(other.get("shard-0001").await, None);
}

// =============================================================================
// Engine Under Failure
// =============================================================================

/// Test: Fetch errors back off and recover without skipping records
#[tokio::test]
async fn fetch_errors_recover() {
    let dir = tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.push("shard-0001", records(1..=7));
    source.fail_next_fetches(1);

    let sink = Arc::new(ScriptedSink::new());
    let config = config();
    let store = Arc::new(
        CheckpointStore::open(dir.path().join("checkpoints.db"), &config.app_name)
            .await
            .unwrap(),
    );
    let factory = WorkerFactory::new(Arc::clone(&sink), FlushThresholds::testing(), RetryConfig::testing());
    let mut engine = ReplicationEngine::new(
        config,
        factory,
        Arc::clone(&source),
        Arc::new(StaticLeaseManager::new()),
        Arc::clone(&store),
    );
    engine.start().await.unwrap();

    wait_for_checkpoint(&store, "shard-0001", Position(7), Duration::from_secs(10)).await;
    assert!(source.fetch_count() >= 3);
    assert_eq!(sink.accepted(), (1..=7).map(Position).collect::<Vec<_>>());

    engine.shutdown().await;
}

/// Test: Shutdown completes promptly while a sink is down, without checkpointing
#[tokio::test]
async fn shutdown_while_sink_down() {
    let dir = tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.push("shard-0001", records(1..=5));
    source.push("shard-0002", records(1..=5));

    let script = (0..10_000).map(|_| Reply::Transport("unavailable".into())).collect();
    let sink = Arc::new(ScriptedSink::with_script(script));
    let mut config = config();
    config.shutdown_timeout = "2s".to_string();
    let store = Arc::new(
        CheckpointStore::open(dir.path().join("checkpoints.db"), &config.app_name)
            .await
            .unwrap(),
    );
    // Long backoff so the workers are parked in a sleep when shutdown arrives.
    let retry = RetryConfig {
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        ..RetryConfig::testing()
    };
    let factory = WorkerFactory::new(Arc::clone(&sink), FlushThresholds::testing(), retry);
    let mut engine = ReplicationEngine::new(
        config,
        factory,
        source,
        Arc::new(StaticLeaseManager::new()),
        Arc::clone(&store),
    );
    engine.start().await.unwrap();

    let sink_ref = Arc::clone(&sink);
    tokio::time::timeout(Duration::from_secs(5), async move {
        while sink_ref.call_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let start = Instant::now();
    engine.shutdown().await;
    let elapsed = start.elapsed();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(elapsed < Duration::from_secs(2), "shutdown took {:?}", elapsed);
    assert!(sink.accepted().is_empty());
    assert!(store.get_all().await.is_empty());
}

/// Test: Many shards replicate concurrently into one store
#[tokio::test]
async fn many_shards_concurrently() {
    let dir = tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    let shard_ids: Vec<String> = (1..=12).map(|i| format!("shard-{:04}", i)).collect();
    for (i, shard_id) in shard_ids.iter().enumerate() {
        source.push(shard_id, records(1..=(i as u64 + 3)));
    }

    let sink = Arc::new(ScriptedSink::new());
    let config = config();
    let store = Arc::new(
        CheckpointStore::open(dir.path().join("checkpoints.db"), &config.app_name)
            .await
            .unwrap(),
    );
    let factory = WorkerFactory::new(Arc::clone(&sink), FlushThresholds::testing(), RetryConfig::testing());
    let mut engine = ReplicationEngine::new(
        config,
        factory,
        source,
        Arc::new(StaticLeaseManager::new()),
        Arc::clone(&store),
    );
    engine.start().await.unwrap();

    for (i, shard_id) in shard_ids.iter().enumerate() {
        wait_for_checkpoint(&store, shard_id, Position(i as u64 + 3), Duration::from_secs(10)).await;
    }

    let health = engine.health_check().await;
    assert_eq!(health.shards_total, 12);
    assert!(health.healthy);

    engine.shutdown().await;
    assert_eq!(store.get_all().await.len(), 12);
}
