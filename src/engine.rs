// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine facade: wires the monitor, dispatcher, queue, sync manager and
//! scheduler together and owns their lifecycle.
//!
//! Construction is cheap and does no I/O beyond opening the store. `start`
//! restores persisted sync state and brings up the background tasks;
//! `shutdown` stops the cadence, cancels waiting dispatches and persists
//! the sync queue. An engine is not restartable after shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::connection::{ConnectionMonitor, PlatformSignals, QualityClass};
use crate::dispatcher::{DispatcherStatus, RequestDispatcher};
use crate::metrics;
use crate::queue::OfflineQueue;
use crate::scheduler::{SchedulerStatus, SyncScheduler};
use crate::storage::{DurableStore, MemoryStore, SqliteStore, StorageError};
use crate::sync::{QueueStatus, SyncManager};
use crate::transport::Transport;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::ShuttingDown => "shutting_down",
        }
    }
}

/// Point-in-time view of the whole engine, for status surfaces.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub state: EngineState,
    pub online: bool,
    pub quality: QualityClass,
    pub pending_actions: u64,
    pub dispatcher: DispatcherStatus,
    pub sync_queue: QueueStatus,
    pub scheduler: SchedulerStatus,
}

pub struct OfflineEngine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    monitor: ConnectionMonitor,
    dispatcher: RequestDispatcher,
    queue: Arc<OfflineQueue>,
    sync: Arc<SyncManager>,
    scheduler: SyncScheduler,
    state_tx: watch::Sender<EngineState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Builds the engine over the host's transport and platform signals.
    /// Opens (or creates) the SQLite store when `db_path` is set, otherwise
    /// everything lives in memory.
    pub async fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        signals: &dyn PlatformSignals,
    ) -> Result<Self, StorageError> {
        let store: Arc<dyn DurableStore> = match &config.db_path {
            Some(path) => {
                info!(path = %path, "opening sqlite store");
                Arc::new(SqliteStore::open(path).await?)
            }
            None => {
                info!("no db_path configured, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let monitor = ConnectionMonitor::new(transport, signals);
        let dispatcher = RequestDispatcher::new(monitor.clone(), config.dispatcher_config());
        let queue = Arc::new(OfflineQueue::new(store.clone(), config.action_max_retries));
        let sync = Arc::new(SyncManager::new(queue.clone(), store.clone(), monitor.clone()));
        let scheduler = SyncScheduler::new(sync.clone(), monitor.clone(), config.scheduler_config());
        let (state_tx, _) = watch::channel(EngineState::Created);

        Ok(Self {
            config,
            store,
            monitor,
            dispatcher,
            queue,
            sync,
            scheduler,
            state_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restores persisted sync state and starts the background tasks.
    /// Idempotent; calling it on anything but a freshly built engine is a
    /// logged no-op.
    pub async fn start(&self) {
        if *self.state_tx.borrow() != EngineState::Created {
            warn!(state = self.state().as_str(), "start ignored");
            return;
        }
        self.set_state(EngineState::Starting);
        info!("offline engine starting");

        self.sync.load().await;

        // Dispatcher concurrency follows the link quality
        let mut quality_rx = self.monitor.subscribe();
        let dispatcher = self.dispatcher.clone();
        let quality_task = tokio::spawn(async move {
            let mut previous = quality_rx.borrow().quality;
            while quality_rx.changed().await.is_ok() {
                let quality = quality_rx.borrow().quality;
                if quality != previous {
                    dispatcher.adjust_concurrency(quality);
                    previous = quality;
                }
            }
        });
        self.tasks.lock().push(quality_task);

        if self.config.cache_sweep_interval_secs > 0 {
            let queue = self.queue.clone();
            let interval = Duration::from_secs(self.config.cache_sweep_interval_secs);
            let sweep_task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick fires immediately; skip it so a sweep isn't
                // part of startup.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match queue.clear_expired_cache().await {
                        Ok(swept) if swept > 0 => debug!(swept, "maintenance cache sweep"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "cache sweep failed"),
                    }
                    if let Ok(pending) = queue.pending_count().await {
                        metrics::set_pending_actions(pending);
                    }
                }
            });
            self.tasks.lock().push(sweep_task);
        }

        self.scheduler.start().await;
        self.set_state(EngineState::Running);
        info!("offline engine running");
    }

    /// Stops the scheduler and maintenance tasks, cancels waiting
    /// dispatches and persists the sync queue. In-flight work is allowed
    /// to finish; nothing new starts.
    pub async fn shutdown(&self) {
        if *self.state_tx.borrow() == EngineState::ShuttingDown {
            return;
        }
        self.set_state(EngineState::ShuttingDown);
        info!("offline engine shutting down");

        self.scheduler.stop();
        let cancelled = self.dispatcher.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.sync.persist().await;

        info!(cancelled_dispatches = cancelled, "offline engine stopped");
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch receiver for lifecycle transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub async fn health(&self) -> EngineHealth {
        let connection = self.monitor.state();
        let pending_actions = match self.queue.pending_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "could not count pending actions");
                0
            }
        };
        EngineHealth {
            state: self.state(),
            online: connection.is_online,
            quality: connection.quality,
            pending_actions,
            dispatcher: self.dispatcher.status(),
            sync_queue: self.sync.queue_status(),
            scheduler: self.scheduler.status(),
        }
    }

    #[must_use]
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    #[must_use]
    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    #[must_use]
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// The storage backend, for host-level inspection or backup tooling.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    fn set_state(&self, state: EngineState) {
        metrics::set_engine_state(state.as_str());
        self.state_tx.send_replace(state);
    }
}
