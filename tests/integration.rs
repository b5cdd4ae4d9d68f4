//! End-to-end tests over the engine facade.
//!
//! Everything runs against the scripted mock transport and manual platform
//! signals, so no network, containers or real timers are involved; the only
//! waiting is short settle sleeps for spawned background work. SQLite cases
//! write under a tempdir.
//!
//! # Test Organization
//! - `happy_*` - normal operation: lifecycle, replay, dispatch, caching
//! - `failure_*` - degraded links: dead letters, parked items, restarts

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use offline_engine::{
    EngineConfig, EngineState, FetchError, LinkHints, ManualSignals, MockTransport, OfflineEngine,
    Operation, Priority, QualityClass, RequestOptions, SyncStatus,
};

// =============================================================================
// Rig Helpers
// =============================================================================

async fn engine_rig(config: EngineConfig) -> (OfflineEngine, Arc<MockTransport>, ManualSignals) {
    let transport = Arc::new(MockTransport::new());
    let signals = ManualSignals::new();
    let engine = OfflineEngine::new(config, transport.clone(), &signals)
        .await
        .expect("engine construction");
    (engine, transport, signals)
}

/// Emits a signal and waits until the monitor has applied it.
async fn signal_and_settle(engine: &OfflineEngine, signals: &ManualSignals, go_online: bool) {
    let mut rx = engine.monitor().subscribe();
    if go_online {
        signals.online();
    } else {
        signals.offline();
    }
    rx.changed().await.expect("monitor alive");
}

/// Lets spawned trigger tasks and sync passes run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// =============================================================================
// Happy Path Tests - Normal Operation
// =============================================================================

#[tokio::test]
async fn happy_offline_actions_replay_in_order_on_reconnect() {
    let (engine, transport, signals) = engine_rig(EngineConfig::default()).await;
    engine.start().await;

    signal_and_settle(&engine, &signals, false).await;

    engine
        .queue()
        .queue_action("vessel/position", json!({"seq": 1}))
        .await
        .expect("queue");
    engine
        .queue()
        .queue_action("vessel/eta", json!({"seq": 2}))
        .await
        .expect("queue");
    engine
        .queue()
        .queue_action("vessel/crew", json!({"seq": 3}))
        .await
        .expect("queue");

    assert_eq!(transport.total_calls(), 0, "offline queueing must not touch the wire");
    assert_eq!(engine.health().await.pending_actions, 3);

    // Regained connectivity triggers an immediate pass
    signal_and_settle(&engine, &signals, true).await;
    settle().await;

    assert_eq!(engine.health().await.pending_actions, 0);
    assert_eq!(
        transport.call_order(),
        vec!["vessel/position", "vessel/eta", "vessel/crew"]
    );

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShuttingDown);
}

#[tokio::test]
async fn happy_urgent_backlog_syncs_right_after_start() {
    let (engine, transport, _signals) = engine_rig(EngineConfig::default()).await;

    // Backlog accumulated before the engine came up
    for seq in 0..12 {
        engine
            .queue()
            .queue_action("vessel/position", json!({"seq": seq}))
            .await
            .expect("queue");
    }

    engine.start().await;
    settle().await;

    assert_eq!(engine.health().await.pending_actions, 0);
    assert_eq!(transport.total_calls(), 12);

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_dispatch_concurrency_follows_the_link() {
    let (engine, transport, signals) = engine_rig(EngineConfig::default()).await;
    engine.start().await;

    let mut rx = engine.monitor().subscribe();
    signals.link_change(LinkHints::quality(QualityClass::TwoG));
    rx.changed().await.expect("monitor alive");
    settle().await;
    assert_eq!(engine.dispatcher().status().max_concurrent, 2);

    transport.set_latency(Duration::from_millis(40));
    let handles: Vec<_> = (0..5)
        .map(|i| {
            engine.dispatcher().enqueue(
                format!("fleet/status/{i}"),
                RequestOptions::get(),
                Priority::Background,
            )
        })
        .collect();
    for handle in handles {
        handle.wait().await.expect("dispatch");
    }

    assert!(
        transport.max_in_flight() <= 2,
        "observed {} concurrent requests on a 2g link",
        transport.max_in_flight()
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_cached_reads_survive_going_offline() {
    let (engine, transport, signals) = engine_rig(EngineConfig::default()).await;
    engine.start().await;

    engine
        .queue()
        .cache_data("vessel/weather", json!({"wind_kts": 23}), Duration::from_secs(60))
        .await
        .expect("cache");

    signal_and_settle(&engine, &signals, false).await;

    let cached = engine
        .queue()
        .get_cached("vessel/weather")
        .await
        .expect("cache read")
        .expect("entry present");
    assert_eq!(cached["wind_kts"], 23);

    // A live fetch fails fast without a transport attempt
    let err = engine
        .monitor()
        .fetch("vessel/weather", &RequestOptions::get())
        .await
        .expect_err("offline fetch");
    assert!(matches!(err, FetchError::NoConnection));
    assert_eq!(transport.total_calls(), 0);

    engine.shutdown().await;
}

// =============================================================================
// Failure Scenario Tests - Degraded Links & Recovery
// =============================================================================

#[tokio::test]
async fn failure_exhausted_action_lands_in_the_dead_letter_channel() {
    let config = EngineConfig {
        action_max_retries: 0,
        ..Default::default()
    };
    let (engine, transport, _signals) = engine_rig(config).await;
    engine.start().await;

    let mut dead = engine.queue().dead_letters();
    transport.script(
        "vessel/position",
        vec![Err(FetchError::Transport("connection reset".into()))],
    );
    engine
        .queue()
        .queue_action("vessel/position", json!({"seq": 9}))
        .await
        .expect("queue");

    let report = engine.sync().sync_all().await;
    assert!(!report.skipped);
    assert_eq!(report.actions_failed, 1);
    assert_eq!(report.actions_dead_lettered, 1);

    let letter = dead.try_recv().expect("dead letter published");
    assert_eq!(letter.action.action_type, "vessel/position");
    assert_eq!(engine.health().await.pending_actions, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_parked_item_revives_on_manual_retry() {
    let (engine, transport, _signals) = engine_rig(EngineConfig::default()).await;
    engine.start().await;

    transport.fail_times("positions", FetchError::Remote { status: 500 }, 4);
    let id = engine
        .sync()
        .queue_mutation(Operation::Insert, "positions", json!({"lat": 57.3}))
        .await;

    // Budget of three retries: four failing passes park the item
    for _ in 0..4 {
        engine.sync().sync_all().await;
    }
    let parked = &engine.sync().items()[0];
    assert_eq!(parked.status, SyncStatus::Failed);

    // Parked items are left alone until someone asks
    engine.sync().sync_all().await;
    assert_eq!(transport.calls("positions"), 4);

    assert!(engine.sync().retry_item(&id).await);
    engine.sync().sync_all().await;
    assert_eq!(engine.sync().items()[0].status, SyncStatus::Completed);
    assert_eq!(engine.sync().queue_status().completed, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_restart_restores_actions_and_tracked_mutations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir
        .path()
        .join("offline.db")
        .to_string_lossy()
        .into_owned();
    let config = EngineConfig {
        db_path: Some(db_path),
        ..Default::default()
    };

    // First run queues work offline and shuts down before any of it syncs
    {
        let (engine, transport, signals) = engine_rig(config.clone()).await;
        engine.start().await;
        signal_and_settle(&engine, &signals, false).await;

        engine
            .queue()
            .queue_action("vessel/position", json!({"seq": 1}))
            .await
            .expect("queue");
        engine
            .queue()
            .queue_action("vessel/eta", json!({"seq": 2}))
            .await
            .expect("queue");
        engine
            .sync()
            .queue_mutation(Operation::Update, "routes", json!({"leg": 4}))
            .await;

        assert_eq!(transport.total_calls(), 0);
        engine.shutdown().await;
    }

    // Second run over the same database picks everything back up
    let (engine, transport, signals) = engine_rig(config).await;
    engine.start().await;

    assert_eq!(engine.health().await.pending_actions, 2);
    assert_eq!(engine.sync().pending_count().await, 3);

    // And the backlog actually drains once a pass runs
    signal_and_settle(&engine, &signals, false).await;
    signal_and_settle(&engine, &signals, true).await;
    settle().await;

    assert_eq!(engine.health().await.pending_actions, 0);
    assert!(transport.total_calls() >= 3);

    engine.shutdown().await;
}
