// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync manager: drains the durable action queue and the tracked mutation
//! queue when connectivity allows.
//!
//! A sync pass has two phases. Replay pushes queued offline actions FIFO,
//! charging one attempt per action per pass. Then tracked mutations
//! ([`SyncQueueItem`]) are pushed one at a time, each moving
//! `pending -> syncing -> completed` or back to `pending` with a retry
//! charge. Losing the connection mid-pass defers the remainder without
//! charging anyone's budget. Only one pass runs at a time; overlapping
//! callers get a `skipped` report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionMonitor;
use crate::error::FetchError;
use crate::metrics;
use crate::queue::OfflineQueue;
use crate::record::{Operation, SyncQueueItem, SyncStatus};
use crate::storage::DurableStore;
use crate::transport::RequestOptions;

/// Outcome of one [`SyncManager::sync_all`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// True when the pass did not run (offline, or another pass in flight).
    pub skipped: bool,
    /// True when the connection dropped mid-pass and the rest was deferred.
    pub connection_lost: bool,
    pub actions_replayed: usize,
    pub actions_failed: usize,
    pub actions_dead_lettered: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub duration: Duration,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn did_work(&self) -> bool {
        self.actions_replayed > 0
            || self.actions_failed > 0
            || self.items_completed > 0
            || self.items_failed > 0
    }
}

/// Counts of tracked mutations by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

// Resets the in-flight flag on every exit path, panics included.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncManager {
    queue: Arc<OfflineQueue>,
    store: Arc<dyn DurableStore>,
    monitor: ConnectionMonitor,
    items: Mutex<Vec<SyncQueueItem>>,
    syncing: AtomicBool,
    passes: AtomicU64,
    last_report: Mutex<Option<SyncReport>>,
}

impl SyncManager {
    pub fn new(
        queue: Arc<OfflineQueue>,
        store: Arc<dyn DurableStore>,
        monitor: ConnectionMonitor,
    ) -> Self {
        Self {
            queue,
            store,
            monitor,
            items: Mutex::new(Vec::new()),
            syncing: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Restores the tracked mutation queue from storage.
    ///
    /// Items caught mid-sync by a crash come back as `pending` so the next
    /// pass picks them up again.
    pub async fn load(&self) {
        match self.store.load_sync_queue().await {
            Ok(mut loaded) => {
                let mut recovered = 0;
                for item in &mut loaded {
                    if item.status == SyncStatus::Syncing {
                        item.status = SyncStatus::Pending;
                        recovered += 1;
                    }
                }
                if recovered > 0 {
                    info!(recovered, "recovered interrupted sync items");
                }
                let count = loaded.len();
                *self.items.lock() = loaded;
                debug!(count, "loaded sync queue snapshot");
            }
            Err(err) => {
                warn!(error = %err, "could not load sync queue, starting empty");
            }
        }
    }

    /// Persists the current tracked mutation queue.
    pub async fn persist(&self) {
        let snapshot = self.items.lock().clone();
        if let Err(err) = self.store.save_sync_queue(&snapshot).await {
            warn!(error = %err, "could not persist sync queue snapshot");
        }
    }

    /// Enqueues a tracked record mutation and returns its id.
    pub async fn queue_mutation(
        &self,
        operation: Operation,
        table: impl Into<String>,
        data: Value,
    ) -> String {
        let item = SyncQueueItem::new(operation, table, data);
        let id = item.id.clone();
        debug!(
            id = %id,
            operation = operation.as_str(),
            table = %item.table,
            "queued tracked mutation"
        );
        self.items.lock().push(item);
        self.persist().await;
        id
    }

    /// Resets a failed item so the next pass tries it again. Returns whether
    /// the id named a failed item.
    pub async fn retry_item(&self, id: &str) -> bool {
        let reset = {
            let mut items = self.items.lock();
            match items
                .iter_mut()
                .find(|i| i.id == id && i.status == SyncStatus::Failed)
            {
                Some(item) => {
                    item.status = SyncStatus::Pending;
                    item.retry_count = 0;
                    true
                }
                None => false,
            }
        };
        if reset {
            info!(id = %id, "failed item queued for manual retry");
            self.persist().await;
        }
        reset
    }

    /// Drops completed items from the queue, returning how many were removed.
    pub async fn clear_completed(&self) -> usize {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|i| i.status != SyncStatus::Completed);
            before - items.len()
        };
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    /// Everything waiting on connectivity: pending and syncing tracked
    /// items plus queued offline actions.
    pub async fn pending_count(&self) -> u64 {
        let items = {
            let items = self.items.lock();
            items
                .iter()
                .filter(|i| matches!(i.status, SyncStatus::Pending | SyncStatus::Syncing))
                .count() as u64
        };
        let actions = match self.queue.pending_count().await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "could not count queued actions");
                0
            }
        };
        items + actions
    }

    /// Snapshot of the tracked mutation queue.
    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.items.lock().clone()
    }

    pub fn queue_status(&self) -> QueueStatus {
        let items = self.items.lock();
        let mut status = QueueStatus::default();
        for item in items.iter() {
            match item.status {
                SyncStatus::Pending => status.pending += 1,
                SyncStatus::Syncing => status.syncing += 1,
                SyncStatus::Completed => status.completed += 1,
                SyncStatus::Failed => status.failed += 1,
            }
        }
        status
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().clone()
    }

    /// Completed (non-skipped) pass count.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Runs one full sync pass. Returns a skipped report when offline or
    /// when another pass is already in flight.
    #[tracing::instrument(skip(self))]
    pub async fn sync_all(&self) -> SyncReport {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync pass already in flight, skipping");
            return SyncReport::skipped();
        }
        let _guard = PassGuard(&self.syncing);

        if !self.monitor.is_online() {
            debug!("offline, skipping sync pass");
            return SyncReport::skipped();
        }

        let started = Instant::now();
        let mut report = SyncReport::default();

        self.replay_actions(&mut report).await;
        if !report.connection_lost {
            self.process_items(&mut report).await;
        }
        self.persist().await;

        report.duration = started.elapsed();
        self.passes.fetch_add(1, Ordering::SeqCst);
        metrics::record_sync_pass(report.duration);
        *self.last_report.lock() = Some(report.clone());

        if report.did_work() {
            info!(
                actions_replayed = report.actions_replayed,
                actions_failed = report.actions_failed,
                items_completed = report.items_completed,
                items_failed = report.items_failed,
                connection_lost = report.connection_lost,
                duration_ms = report.duration.as_millis() as u64,
                "sync pass finished"
            );
        } else {
            debug!(
                connection_lost = report.connection_lost,
                "sync pass finished with nothing to do"
            );
        }
        report
    }

    /// Replays queued offline actions oldest first. One transport attempt
    /// per action per pass; losing the connection defers the rest without
    /// charging their budgets.
    async fn replay_actions(&self, report: &mut SyncReport) {
        let actions = match self.queue.pending_actions().await {
            Ok(actions) => actions,
            Err(err) => {
                warn!(error = %err, "could not list queued actions");
                return;
            }
        };

        for action in actions {
            let options = RequestOptions::post(action.payload.clone());
            match self.monitor.fetch(&action.action_type, &options).await {
                Ok(_) => {
                    if let Err(err) = self.queue.remove_action(&action.id).await {
                        warn!(id = %action.id, error = %err, "could not remove replayed action");
                    }
                    report.actions_replayed += 1;
                }
                Err(FetchError::NoConnection) => {
                    debug!("connection lost mid-replay, deferring remaining actions");
                    report.connection_lost = true;
                    return;
                }
                Err(err) => {
                    warn!(
                        id = %action.id,
                        action_type = %action.action_type,
                        error = %err,
                        "action replay failed"
                    );
                    report.actions_failed += 1;
                    match self.queue.increment_retry(&action.id).await {
                        Ok(true) => {}
                        Ok(false) => report.actions_dead_lettered += 1,
                        Err(err) => {
                            warn!(id = %action.id, error = %err, "could not charge retry");
                        }
                    }
                }
            }
        }
    }

    /// Pushes each pending tracked mutation once. Failures charge the item's
    /// retry budget; an exhausted budget parks it as `failed` until a manual
    /// retry.
    async fn process_items(&self, report: &mut SyncReport) {
        let pending_ids: Vec<String> = {
            let items = self.items.lock();
            items
                .iter()
                .filter(|i| i.status == SyncStatus::Pending)
                .map(|i| i.id.clone())
                .collect()
        };

        for id in pending_ids {
            let Some((operation, table, data)) = self.begin_item(&id) else {
                continue;
            };

            let options = RequestOptions {
                method: operation.verb().to_string(),
                body: Some(data),
            };
            match self.monitor.fetch(&table, &options).await {
                Ok(_) => {
                    self.set_status(&id, SyncStatus::Completed);
                    report.items_completed += 1;
                }
                Err(FetchError::NoConnection) => {
                    // Defer without charging: the item never really got a shot
                    self.set_status(&id, SyncStatus::Pending);
                    debug!("connection lost mid-sync, deferring remaining items");
                    report.connection_lost = true;
                    return;
                }
                Err(err) => {
                    let exhausted = self.charge_item_retry(&id);
                    if exhausted {
                        warn!(
                            id = %id,
                            table = %table,
                            error = %err,
                            "item exhausted retry budget, marking failed"
                        );
                        report.items_failed += 1;
                    } else {
                        debug!(id = %id, table = %table, error = %err, "item sync failed, will retry");
                    }
                }
            }
        }
    }

    /// Marks the item syncing and returns its request fields, or `None` if
    /// it was removed or is no longer pending.
    fn begin_item(&self, id: &str) -> Option<(Operation, String, Value)> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|i| i.id == id && i.status == SyncStatus::Pending)?;
        item.status = SyncStatus::Syncing;
        Some((item.operation, item.table.clone(), item.data.clone()))
    }

    fn set_status(&self, id: &str, status: SyncStatus) {
        let mut items = self.items.lock();
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            item.status = status;
        }
    }

    /// Charges one failed attempt. Returns true when the budget is spent and
    /// the item has been parked as failed.
    fn charge_item_retry(&self, id: &str) -> bool {
        let mut items = self.items.lock();
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        item.retry_count = item.retry_count.saturating_add(1);
        if item.retry_count > item.max_retries {
            item.status = SyncStatus::Failed;
            true
        } else {
            item.status = SyncStatus::Pending;
            false
        }
    }
}
