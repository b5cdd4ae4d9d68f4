//! Chaos tests for the offline engine.
//!
//! Failure scenarios covered here:
//! 1. **FailingStore wrapper** - precise storage error injection at specific
//!    call counts, plus a switchable permanent outage
//! 2. **Hostile transport** - every request failing, dead-letter storms
//! 3. **Lifecycle abuse** - shutdown without start, operations after
//!    shutdown, rapid start/stop cycles
//!
//! Nothing here needs a network or containers; the point is that the engine
//! degrades with errors and logs, never with panics or deadlocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use offline_engine::{
    CacheEntry, ConnectionMonitor, DurableStore, EngineConfig, EngineState, FetchError,
    ManualSignals, MemoryStore, MockTransport, OfflineEngine, OfflineQueue, PersistedAction,
    Priority, RequestOptions, StorageError, SyncManager, SyncQueueItem,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps the in-memory store and injects backend errors, either on scripted
/// call numbers (1-indexed, across every trait method) or permanently after
/// `go_dark` is called.
struct FailingStore {
    inner: MemoryStore,
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
    /// First call number that fails permanently; 0 disables the outage.
    fail_from: AtomicU64,
}

impl FailingStore {
    fn failing_on(fail_on_calls: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            call_count: AtomicU64::new(0),
            fail_on_calls,
            fail_from: AtomicU64::new(0),
        })
    }

    /// Every call from now on fails, as if the disk vanished.
    fn go_dark(&self) {
        self.fail_from
            .store(self.call_count.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    fn restore(&self) {
        self.fail_from.store(0, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let from = self.fail_from.load(Ordering::SeqCst);
        if from > 0 && count >= from {
            return true;
        }
        self.fail_on_calls.contains(&count)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        if self.should_fail() {
            Err(StorageError::Backend("injected backend failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn append_action(&self, action: &PersistedAction) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.append_action(action).await
    }

    async fn get_action(&self, id: &str) -> Result<Option<PersistedAction>, StorageError> {
        self.maybe_fail()?;
        self.inner.get_action(id).await
    }

    async fn list_actions(&self) -> Result<Vec<PersistedAction>, StorageError> {
        self.maybe_fail()?;
        self.inner.list_actions().await
    }

    async fn update_action_retries(
        &self,
        id: &str,
        retry_count: u32,
    ) -> Result<bool, StorageError> {
        self.maybe_fail()?;
        self.inner.update_action_retries(id, retry_count).await
    }

    async fn delete_action(&self, id: &str) -> Result<bool, StorageError> {
        self.maybe_fail()?;
        self.inner.delete_action(id).await
    }

    async fn count_actions(&self) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.count_actions().await
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.put_cache(entry).await
    }

    async fn get_cache(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.maybe_fail()?;
        self.inner.get_cache(key).await
    }

    async fn delete_cache(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.delete_cache(key).await
    }

    async fn sweep_cache(&self, now_ms: i64) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.sweep_cache(now_ms).await
    }

    async fn save_sync_queue(&self, items: &[SyncQueueItem]) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.save_sync_queue(items).await
    }

    async fn load_sync_queue(&self) -> Result<Vec<SyncQueueItem>, StorageError> {
        self.maybe_fail()?;
        self.inner.load_sync_queue().await
    }
}

// =============================================================================
// Rig Helpers
// =============================================================================

fn manager_rig(
    store: Arc<dyn DurableStore>,
) -> (Arc<SyncManager>, Arc<OfflineQueue>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let signals = ManualSignals::new();
    let monitor = ConnectionMonitor::new(transport.clone(), &signals);
    let queue = Arc::new(OfflineQueue::new(store.clone(), 0));
    let manager = Arc::new(SyncManager::new(queue.clone(), store, monitor));
    (manager, queue, transport)
}

async fn engine_rig() -> (Arc<OfflineEngine>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let signals = ManualSignals::new();
    let engine = OfflineEngine::new(EngineConfig::default(), transport.clone(), &signals)
        .await
        .expect("engine construction");
    (Arc::new(engine), transport)
}

// =============================================================================
// Chaos Tests - Storage Error Injection
// =============================================================================

#[tokio::test]
async fn chaos_injected_write_failure_surfaces_as_an_error() {
    let store = FailingStore::failing_on(vec![1]);
    let queue = OfflineQueue::new(store, 3);

    let err = queue
        .queue_action("vessel/position", json!({"seq": 1}))
        .await
        .expect_err("first write is scripted to fail");
    assert!(matches!(err, StorageError::Backend(_)));

    // The queue carries no poisoned state; the next write lands
    queue
        .queue_action("vessel/position", json!({"seq": 2}))
        .await
        .expect("second write");
    assert_eq!(queue.pending_count().await.expect("count"), 1);
}

#[tokio::test]
async fn chaos_sync_pass_survives_the_store_going_dark() {
    let store = FailingStore::failing_on(vec![]);
    let (manager, queue, transport) = manager_rig(store.clone());

    queue
        .queue_action("vessel/position", json!({"seq": 1}))
        .await
        .expect("queue");
    queue
        .queue_action("vessel/eta", json!({"seq": 2}))
        .await
        .expect("queue");

    store.go_dark();
    let report = manager.sync_all().await;
    assert!(!report.skipped, "pass ran even though the store was dark");
    assert_eq!(report.actions_replayed, 0);
    assert_eq!(transport.total_calls(), 0, "nothing reached the wire");

    // Disk comes back; the backlog is intact and drains normally
    store.restore();
    let report = manager.sync_all().await;
    assert_eq!(report.actions_replayed, 2);
    assert_eq!(transport.call_order(), vec!["vessel/position", "vessel/eta"]);
}

// =============================================================================
// Chaos Tests - Hostile Transport
// =============================================================================

#[tokio::test]
async fn chaos_dead_letter_storm_drains_the_backlog() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let (manager, queue, transport) = manager_rig(store);
    transport.set_default_outcome(Err(FetchError::Transport("link flapping".into())));

    let mut dead = queue.dead_letters();
    for seq in 0..5 {
        queue
            .queue_action("vessel/position", json!({"seq": seq}))
            .await
            .expect("queue");
    }

    // Zero retry budget: one hostile pass kills everything
    let report = manager.sync_all().await;
    assert_eq!(report.actions_failed, 5);
    assert_eq!(report.actions_dead_lettered, 5);
    assert_eq!(queue.pending_count().await.expect("count"), 0);

    for _ in 0..5 {
        dead.try_recv().expect("dead letter per action");
    }
}

// =============================================================================
// Chaos Tests - Lifecycle Abuse
// =============================================================================

#[tokio::test]
async fn chaos_shutdown_without_start_is_safe() {
    let (engine, _transport) = engine_rig().await;
    assert_eq!(engine.state(), EngineState::Created);

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShuttingDown);

    // And again; still nothing to trip over
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_operations_after_shutdown_do_not_panic() {
    let (engine, _transport) = engine_rig().await;
    engine.start().await;
    engine.shutdown().await;

    // Storage is still attached, so queueing works
    engine
        .queue()
        .queue_action("vessel/position", json!({"seq": 7}))
        .await
        .expect("queue after shutdown");

    // A manual pass still runs to completion
    let report = engine.sync().sync_all().await;
    assert!(!report.skipped);

    // The dispatcher is paused, so new work parks instead of running
    let _handle =
        engine
            .dispatcher()
            .enqueue("fleet/status", RequestOptions::get(), Priority::High);
    assert_eq!(engine.dispatcher().status().waiting, 1);
    assert!(engine.dispatcher().status().paused);
}

#[tokio::test]
async fn chaos_rapid_start_stop_cycles() {
    for cycle in 0..5 {
        let (engine, _transport) = engine_rig().await;
        engine.start().await;
        assert_eq!(engine.state(), EngineState::Running);

        engine
            .queue()
            .queue_action("vessel/position", json!({"cycle": cycle}))
            .await
            .expect("queue");

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
    }
}

// =============================================================================
// Chaos Tests - Concurrency
// =============================================================================

#[tokio::test]
async fn chaos_concurrent_writers_and_sync_passes() {
    let (engine, transport) = engine_rig().await;
    engine.start().await;

    let mut writers = Vec::new();
    for writer in 0..4 {
        let engine = engine.clone();
        writers.push(tokio::spawn(async move {
            for seq in 0..10 {
                engine
                    .queue()
                    .queue_action(format!("writer/{writer}"), json!({"seq": seq}))
                    .await
                    .expect("queue");
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }));
    }

    // Passes race the writers; overlapping calls collapse instead of
    // deadlocking
    let syncer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                engine.sync().sync_all().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    for writer in writers {
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer finished")
            .expect("writer task");
    }
    tokio::time::timeout(Duration::from_secs(5), syncer)
        .await
        .expect("syncer finished")
        .expect("syncer task");

    // Drain whatever the racing passes left behind
    for _ in 0..3 {
        if engine.health().await.pending_actions == 0 {
            break;
        }
        engine.sync().sync_all().await;
    }

    assert_eq!(engine.health().await.pending_actions, 0);
    assert_eq!(transport.total_calls(), 40);

    engine.shutdown().await;
}
