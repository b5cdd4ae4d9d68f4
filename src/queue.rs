//! Durable offline queue and TTL response cache.
//!
//! Actions queued here survive restarts and are replayed FIFO by the sync
//! manager once connectivity returns. Each action carries its own retry
//! budget; an action that exhausts it is dead-lettered (deleted and
//! broadcast to observers) rather than blocking the queue forever.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::metrics;
use crate::record::{now_ms, CacheEntry, PersistedAction};
use crate::storage::{DurableStore, StorageError};

const DEAD_LETTER_CHANNEL_CAPACITY: usize = 32;

/// An action dropped after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub action: PersistedAction,
}

pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    default_max_retries: u32,
    dead_letter_tx: broadcast::Sender<DeadLetter>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn DurableStore>, default_max_retries: u32) -> Self {
        let (dead_letter_tx, _) = broadcast::channel(DEAD_LETTER_CHANNEL_CAPACITY);
        Self {
            store,
            default_max_retries,
            dead_letter_tx,
        }
    }

    /// Persists an action for later replay and returns its id.
    pub async fn queue_action(
        &self,
        action_type: impl Into<String>,
        payload: Value,
    ) -> Result<String, StorageError> {
        self.queue_action_with_retries(action_type, payload, self.default_max_retries)
            .await
    }

    pub async fn queue_action_with_retries(
        &self,
        action_type: impl Into<String>,
        payload: Value,
        max_retries: u32,
    ) -> Result<String, StorageError> {
        let action = PersistedAction::new(action_type, payload, max_retries);
        self.store.append_action(&action).await?;
        debug!(
            id = %action.id,
            action_type = %action.action_type,
            "queued action for replay"
        );
        Ok(action.id)
    }

    /// All queued actions in replay order (oldest first).
    pub async fn pending_actions(&self) -> Result<Vec<PersistedAction>, StorageError> {
        self.store.list_actions().await
    }

    pub async fn pending_count(&self) -> Result<u64, StorageError> {
        self.store.count_actions().await
    }

    /// Removes a replayed (or abandoned) action. Returns whether it existed.
    pub async fn remove_action(&self, id: &str) -> Result<bool, StorageError> {
        self.store.delete_action(id).await
    }

    /// Charges one failed replay against the action's retry budget.
    ///
    /// Returns `Ok(true)` while the action still has budget left. Once the
    /// budget is spent the action is deleted, broadcast as a [`DeadLetter`]
    /// and `Ok(false)` is returned. With a budget of N, exactly N calls
    /// return `true` and the next one dead-letters. Unknown ids return
    /// `Ok(false)` without side effects.
    pub async fn increment_retry(&self, id: &str) -> Result<bool, StorageError> {
        let Some(action) = self.store.get_action(id).await? else {
            return Ok(false);
        };

        let new_count = action.retry_count.saturating_add(1);
        if new_count > action.max_retries {
            self.store.delete_action(id).await?;
            error!(
                id = %action.id,
                action_type = %action.action_type,
                retries = action.retry_count,
                "action exhausted retry budget, dead-lettering"
            );
            metrics::record_dead_letter(&action.action_type);
            let _ = self.dead_letter_tx.send(DeadLetter { action });
            return Ok(false);
        }

        self.store.update_action_retries(id, new_count).await?;
        Ok(true)
    }

    /// Subscribes to actions dropped after exhausting their retry budget.
    pub fn dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.dead_letter_tx.subscribe()
    }

    /// Caches a response value under `key` for `ttl`.
    pub async fn cache_data(
        &self,
        key: impl Into<String>,
        data: Value,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let entry = CacheEntry::new(key, data, ttl);
        self.store.put_cache(&entry).await
    }

    /// Returns the cached value for `key` if present and not expired.
    ///
    /// Expired entries are evicted on read, so a later sweep pass is an
    /// optimization rather than a correctness requirement.
    pub async fn get_cached(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.store.get_cache(key).await? {
            Some(entry) if entry.is_expired_at(now_ms()) => {
                self.store.delete_cache(key).await?;
                debug!(key = %key, "evicted expired cache entry on read");
                metrics::record_cache("expired");
                Ok(None)
            }
            Some(entry) => {
                metrics::record_cache("hit");
                Ok(Some(entry.data))
            }
            None => {
                metrics::record_cache("miss");
                Ok(None)
            }
        }
    }

    /// Deletes every expired cache entry, returning how many were removed.
    pub async fn clear_expired_cache(&self) -> Result<u64, StorageError> {
        let swept = self.store.sweep_cache(now_ms()).await?;
        if swept > 0 {
            debug!(swept, "swept expired cache entries");
        }
        Ok(swept)
    }
}
