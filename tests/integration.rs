// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Dual-Write Engine
//!
//! Memory-backed tests run by default. Redis tests use testcontainers and are
//! ignored unless requested.
//!
//! # Running Tests
//! ```bash
//! # Memory-backed end-to-end tests
//! cargo test --test integration
//!
//! # Include Redis tests (requires Docker)
//! cargo test --test integration -- --include-ignored
//! ```
//!
//! # Test Organization
//! - `dual_write_*` - dispatch through to replay on the second store
//! - `replay_*` - consumer retry, idempotency and dead letters
//! - `redis_*` - the same paths against a real Redis

mod common;

use common::{user_call, user_message, wait_until, FakeStores, FlakyTransport, TestRedis};
use dual_write_engine::config::{DualWriteConfig, MqBackend};
use dual_write_engine::dead_letter::{DeadLetterHook, LogDeadLetter, SqliteDeadLetterStore};
use dual_write_engine::idempotency::{IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
use dual_write_engine::transport::{MemoryTransport, RedisStreamTransport, Transport};
use dual_write_engine::types::{OperationKind, StoreTarget, WriteMode};
use dual_write_engine::write_mode::MemoryWriteModeStore;
use dual_write_engine::{DualWriteEngine, EngineState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use testcontainers::clients::Cli;

const WAIT: Duration = Duration::from_secs(3);

/// Engine over fake stores and a memory transport the test can inspect.
struct Harness {
    engine: DualWriteEngine,
    stores: Arc<FakeStores>,
    modes: Arc<MemoryWriteModeStore>,
    transport: Arc<MemoryTransport>,
}

fn harness(mode: WriteMode) -> Harness {
    harness_with(mode, Arc::new(LogDeadLetter))
}

fn harness_with(mode: WriteMode, dead_letter: Arc<dyn DeadLetterHook>) -> Harness {
    let stores = FakeStores::new();
    let modes = Arc::new(MemoryWriteModeStore::with_mode(mode));
    let transport = Arc::new(MemoryTransport::recording());
    let engine = DualWriteEngine::from_parts(
        DualWriteConfig::for_testing(),
        stores.clone(),
        modes.clone(),
        Arc::new(MemoryIdempotencyStore::new()),
        transport.clone(),
        dead_letter,
    )
    .unwrap();
    Harness {
        engine,
        stores,
        modes,
        transport,
    }
}

// =============================================================================
// Dual-Write Paths
// =============================================================================

#[tokio::test]
async fn dual_write_create_replicates_to_secondary() {
    let h = harness(WriteMode::PrimaryThenSecondary);
    h.engine.start().await.unwrap();

    let result = h
        .engine
        .dispatcher()
        .handle(user_call("insertUser", 1, "ada"))
        .await
        .unwrap();
    assert_eq!(result["name"], "ada");

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.target_store, StoreTarget::Secondary);
    assert_eq!(sent[0].message.retry_count, 0);
    assert_eq!(sent[0].message.operation_kind, OperationKind::Create);

    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.row(StoreTarget::Secondary, 1).is_some()).await);
    assert_eq!(h.stores.row(StoreTarget::Primary, 1), h.stores.row(StoreTarget::Secondary, 1));

    let calls = h.stores.calls();
    assert_eq!(calls[0].target, StoreTarget::Primary);
    assert_eq!(calls[0].scoped, Some(StoreTarget::Primary));
    assert_eq!(calls[1].target, StoreTarget::Secondary);
    assert_eq!(calls[1].scoped, Some(StoreTarget::Secondary));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn dual_write_legacy_secondary_master_update_targets_primary() {
    let h = harness(WriteMode::PrimaryOnly);
    h.modes.set_raw("SECONDARY_MASTER");
    h.engine.start().await.unwrap();

    h.engine
        .dispatcher()
        .handle(user_call("updateUser", 2, "grace"))
        .await
        .unwrap();

    assert_eq!(h.stores.calls()[0].target, StoreTarget::Secondary);
    assert_eq!(h.transport.sent()[0].message.target_store, StoreTarget::Primary);

    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.row(StoreTarget::Primary, 2).is_some()).await);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn dual_write_primary_only_delete_creates_no_message() {
    let h = harness(WriteMode::PrimaryOnly);
    h.engine.start().await.unwrap();

    h.engine
        .dispatcher()
        .handle(user_call("deleteUser", 3, "x"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.stores.calls_on(StoreTarget::Primary), 1);
    assert_eq!(h.stores.calls_on(StoreTarget::Secondary), 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn dual_write_reads_never_replicate() {
    let h = harness(WriteMode::SecondaryThenPrimary);
    let dispatcher = h.engine.dispatcher();

    dispatcher.handle(user_call("findUserById", 4, "")).await.unwrap();
    dispatcher.handle(user_call("countUsers", 4, "")).await.unwrap();

    assert!(h.transport.sent().is_empty());
    assert_eq!(h.stores.calls_on(StoreTarget::Secondary), 2);
}

#[tokio::test]
async fn dual_write_first_failure_reaches_caller() {
    let h = harness(WriteMode::PrimaryThenSecondary);
    h.stores.fail_next(StoreTarget::Primary, 1);

    let err = h
        .engine
        .dispatcher()
        .handle(user_call("insertUser", 5, "x"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("primary unavailable"));
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn dual_write_send_failure_returns_first_result() {
    let stores = FakeStores::new();
    let transport = FlakyTransport::new();
    transport.set_fail_send(true);
    let engine = DualWriteEngine::from_parts(
        DualWriteConfig::for_testing(),
        stores.clone(),
        Arc::new(MemoryWriteModeStore::with_mode(WriteMode::PrimaryThenSecondary)),
        Arc::new(MemoryIdempotencyStore::new()),
        transport.clone(),
        Arc::new(LogDeadLetter),
    )
    .unwrap();

    let result = engine
        .dispatcher()
        .handle(user_call("insertUser", 6, "kept"))
        .await
        .unwrap();

    assert_eq!(result["name"], "kept");
    assert_eq!(stores.row(StoreTarget::Primary, 6).unwrap()["name"], "kept");
    assert!(transport.inner.sent().is_empty());
}

#[tokio::test]
async fn dual_write_target_fixed_at_creation() {
    let h = harness(WriteMode::PrimaryThenSecondary);

    h.engine
        .dispatcher()
        .handle(user_call("saveUser", 7, "before"))
        .await
        .unwrap();
    h.engine
        .set_write_mode(WriteMode::SecondaryThenPrimary)
        .await
        .unwrap();
    h.engine.start().await.unwrap();

    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.row(StoreTarget::Secondary, 7).is_some()).await);
    assert_eq!(h.stores.calls_on(StoreTarget::Primary), 1);
    h.engine.shutdown().await;
}

// =============================================================================
// Replay: Retry, Idempotency, Dead Letters
// =============================================================================

#[tokio::test]
async fn replay_redelivery_is_not_reapplied() {
    let h = harness(WriteMode::PrimaryThenSecondary);
    h.engine.start().await.unwrap();

    let msg = user_message("updateUser", 10, StoreTarget::Secondary);
    h.transport.send(&msg).await.unwrap();
    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.calls_on(StoreTarget::Secondary) == 1).await);

    h.transport.send(&msg).await.unwrap();
    let transport = h.transport.clone();
    assert!(wait_until(WAIT, || transport.ready_count() == 0 && transport.in_flight_count() == 0).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.stores.calls_on(StoreTarget::Secondary), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn replay_transient_failure_recovers() {
    let h = harness(WriteMode::PrimaryThenSecondary);
    h.stores.fail_next(StoreTarget::Secondary, 2);
    h.engine.start().await.unwrap();

    h.engine
        .dispatcher()
        .handle(user_call("insertUser", 11, "eventually"))
        .await
        .unwrap();

    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.row(StoreTarget::Secondary, 11).is_some()).await);
    assert_eq!(h.stores.calls_on(StoreTarget::Secondary), 3);

    let delays: Vec<_> = h.transport.sent().iter().filter_map(|s| s.delay).collect();
    assert_eq!(delays, vec![Duration::from_millis(10), Duration::from_millis(20)]);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn replay_exhausted_retries_dead_letter() {
    let dir = tempdir().unwrap();
    let dead_letters = Arc::new(SqliteDeadLetterStore::new(dir.path().join("dl.db")).await.unwrap());
    let h = harness_with(WriteMode::PrimaryThenSecondary, dead_letters.clone());
    h.stores.fail_always(StoreTarget::Secondary);
    h.engine.start().await.unwrap();

    h.engine
        .dispatcher()
        .handle(user_call("updateUser", 12, "doomed"))
        .await
        .unwrap();

    let mut abandoned = Vec::new();
    for _ in 0..300 {
        abandoned = dead_letters.list(10).await.unwrap();
        if !abandoned.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].message.retry_count, 4);
    assert_eq!(abandoned[0].message.succeeded, Some(false));
    assert!(abandoned[0].reason.contains("secondary unavailable"));

    // One first attempt plus exactly three retries.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.stores.calls_on(StoreTarget::Secondary), 4);

    let delays: Vec<_> = h.transport.sent().iter().filter_map(|s| s.delay).collect();
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn replay_unschedulable_retry_dead_letters() {
    let stores = FakeStores::new();
    stores.fail_always(StoreTarget::Secondary);
    let transport = FlakyTransport::new();
    transport.set_fail_send_delayed(true);
    let dir = tempdir().unwrap();
    let dead_letters = Arc::new(SqliteDeadLetterStore::new(dir.path().join("dl.db")).await.unwrap());

    let engine = DualWriteEngine::from_parts(
        DualWriteConfig::for_testing(),
        stores.clone(),
        Arc::new(MemoryWriteModeStore::with_mode(WriteMode::PrimaryThenSecondary)),
        Arc::new(MemoryIdempotencyStore::new()),
        transport.clone(),
        dead_letters.clone(),
    )
    .unwrap();

    let outcome = engine
        .consumer()
        .process(user_message("updateUser", 13, StoreTarget::Secondary))
        .await;

    assert_eq!(outcome, dual_write_engine::ConsumeOutcome::Abandoned);
    let entries = dead_letters.list(1).await.unwrap();
    assert_eq!(entries[0].message.retry_count, 1);
    assert!(entries[0].reason.contains("retry enqueue failed"));
}

#[tokio::test]
async fn replay_reclaims_unacked_delivery() {
    let h = harness(WriteMode::PrimaryThenSecondary);

    let msg = user_message("updateUser", 14, StoreTarget::Secondary);
    h.transport.send(&msg).await.unwrap();
    // A consumer that takes the delivery and dies before acking.
    let taken = h.transport.receive(1, Duration::from_millis(10)).await.unwrap();
    assert_eq!(taken.len(), 1);

    h.engine.start().await.unwrap();
    let stores = h.stores.clone();
    assert!(wait_until(WAIT, || stores.row(StoreTarget::Secondary, 14).is_some()).await);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn replay_worker_survives_receive_errors() {
    let stores = FakeStores::new();
    let transport = FlakyTransport::new();
    transport.fail_receives(3);

    let engine = DualWriteEngine::from_parts(
        DualWriteConfig::for_testing(),
        stores.clone(),
        Arc::new(MemoryWriteModeStore::with_mode(WriteMode::PrimaryThenSecondary)),
        Arc::new(MemoryIdempotencyStore::new()),
        transport.clone(),
        Arc::new(LogDeadLetter),
    )
    .unwrap();
    engine.start().await.unwrap();

    engine
        .dispatcher()
        .handle(user_call("insertUser", 15, "late"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || stores.row(StoreTarget::Secondary, 15).is_some()).await);
    engine.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn engine_health_reflects_lifecycle() {
    let h = harness(WriteMode::PrimaryThenSecondary);

    let before = h.engine.health_check().await;
    assert_eq!(before.state, EngineState::Created);
    assert!(!before.ready);
    assert_eq!(before.write_mode, WriteMode::PrimaryThenSecondary);

    h.engine.start().await.unwrap();
    let running = h.engine.health_check().await;
    assert!(running.healthy);
    assert_eq!(running.transport, "memory");
    assert_eq!(running.transport_depth.map(|d| d.ready), Some(0));

    h.engine.shutdown().await;
    assert!(!h.engine.health_check().await.ready);
}

// =============================================================================
// Redis
// =============================================================================

fn redis_config(url: &str) -> DualWriteConfig {
    let mut config = DualWriteConfig::for_testing();
    config.redis_url = Some(url.to_string());
    config.mq.backend = MqBackend::Auto;
    config
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_end_to_end_replication() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let config = redis_config(&redis.url);
    let stores = FakeStores::new();

    let engine = DualWriteEngine::new(config.clone(), stores.clone()).await.unwrap();
    assert_eq!(engine.transport().name(), "redis_stream");

    engine.set_write_mode(WriteMode::PrimaryThenSecondary).await.unwrap();
    assert_eq!(
        redis.get(&config.write_mode.redis_key).await.as_deref(),
        Some("PRIMARY_THEN_SECONDARY")
    );

    engine.start().await.unwrap();
    engine
        .dispatcher()
        .handle(user_call("insertUser", 21, "via-redis"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || stores.row(StoreTarget::Secondary, 21).is_some()).await);

    let health = engine.health_check().await;
    assert!(health.healthy);
    assert!(health.redis_latency.is_some());
    engine.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_delayed_retry_is_promoted() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let config = redis_config(&redis.url);
    let stores = FakeStores::new();
    stores.fail_next(StoreTarget::Secondary, 1);

    let engine = DualWriteEngine::new(config.clone(), stores.clone()).await.unwrap();
    engine.set_write_mode(WriteMode::PrimaryThenSecondary).await.unwrap();
    engine.start().await.unwrap();

    engine
        .dispatcher()
        .handle(user_call("insertUser", 22, "second-try"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || stores.row(StoreTarget::Secondary, 22).is_some()).await);
    assert_eq!(stores.calls_on(StoreTarget::Secondary), 2);
    assert_eq!(redis.zcard(&config.mq.delay_key).await, 0);
    engine.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_unparseable_mode_falls_back_to_default() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let mut config = redis_config(&redis.url);
    config.write_mode.default = WriteMode::SecondaryOnly;

    let engine = DualWriteEngine::new(config.clone(), FakeStores::new()).await.unwrap();
    assert_eq!(engine.write_mode().await, WriteMode::SecondaryOnly);

    redis.set(&config.write_mode.redis_key, "BOTH_PLEASE").await;
    assert_eq!(engine.write_mode().await, WriteMode::SecondaryOnly);

    redis.set(&config.write_mode.redis_key, "MASTER_SLAVE").await;
    assert_eq!(engine.write_mode().await, WriteMode::PrimaryThenSecondary);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_idempotency_marker_expires() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let store = RedisIdempotencyStore::new(redis.connection().await, "test:idem:");

    assert!(!store.exists("m-1").await.unwrap());
    store.mark_processed("m-1", Duration::from_secs(60)).await.unwrap();
    assert!(store.exists("m-1").await.unwrap());

    let ttl = redis.ttl("test:idem:m-1").await;
    assert!(ttl > 0 && ttl <= 60);

    store.mark_processed("", Duration::from_secs(60)).await.unwrap();
    assert!(!store.exists("").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_stream_reclaims_from_dead_consumer() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);

    let mut config = DualWriteConfig::for_testing().mq;
    config.consumer_name = Some("doomed".into());
    let doomed = RedisStreamTransport::new(redis.connection().await, redis.connection().await, &config)
        .await
        .unwrap();
    config.consumer_name = Some("survivor".into());
    let survivor = RedisStreamTransport::new(redis.connection().await, redis.connection().await, &config)
        .await
        .unwrap();

    let msg = user_message("updateUser", 23, StoreTarget::Primary);
    doomed.send(&msg).await.unwrap();
    let taken = doomed.receive(1, Duration::from_millis(100)).await.unwrap();
    assert_eq!(taken.len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reclaimed = survivor.reclaim(Duration::from_millis(10), 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message, msg);

    survivor.ack(&reclaimed[0].receipt).await.unwrap();
    assert!(survivor.reclaim(Duration::ZERO, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_stream_delayed_message_waits() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let config = DualWriteConfig::for_testing().mq;
    let transport = RedisStreamTransport::new(redis.connection().await, redis.connection().await, &config)
        .await
        .unwrap();

    let msg = user_message("updateUser", 24, StoreTarget::Secondary);
    transport.send_delayed(&msg, Duration::from_millis(300)).await.unwrap();
    assert_eq!(redis.zcard(&config.delay_key).await, 1);

    let early = transport.receive(10, Duration::from_millis(50)).await.unwrap();
    assert!(early.is_empty());

    tokio::time::sleep(Duration::from_millis(350)).await;
    let due = transport.receive(10, Duration::from_millis(100)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].message, msg);
    assert_eq!(redis.zcard(&config.delay_key).await, 0);
    assert_eq!(redis.xlen(&config.stream_key).await, 1);
}
