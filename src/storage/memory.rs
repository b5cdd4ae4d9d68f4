use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{DurableStore, StorageError};
use crate::record::{CacheEntry, PersistedAction, SyncQueueItem};

/// In-memory [`DurableStore`] for tests and hosts that accept losing the
/// backlog on exit.
///
/// Actions carry an insertion sequence so `list_actions` stays FIFO even
/// when two enqueues land on the same millisecond.
pub struct MemoryStore {
    actions: DashMap<String, (u64, PersistedAction)>,
    cache: DashMap<String, CacheEntry>,
    sync_queue: RwLock<Vec<SyncQueueItem>>,
    seq: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: DashMap::new(),
            cache: DashMap::new(),
            sync_queue: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of cache entries currently held, expired or not.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn append_action(&self, action: &PersistedAction) -> Result<(), StorageError> {
        if self.actions.contains_key(&action.id) {
            return Err(StorageError::Backend(format!(
                "duplicate action id {}",
                action.id
            )));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.actions.insert(action.id.clone(), (seq, action.clone()));
        Ok(())
    }

    async fn get_action(&self, id: &str) -> Result<Option<PersistedAction>, StorageError> {
        Ok(self.actions.get(id).map(|r| r.value().1.clone()))
    }

    async fn list_actions(&self) -> Result<Vec<PersistedAction>, StorageError> {
        let mut rows: Vec<(u64, PersistedAction)> = self
            .actions
            .iter()
            .map(|r| (r.value().0, r.value().1.clone()))
            .collect();
        rows.sort_by_key(|(seq, action)| (action.enqueued_at, *seq));
        Ok(rows.into_iter().map(|(_, action)| action).collect())
    }

    async fn update_action_retries(
        &self,
        id: &str,
        retry_count: u32,
    ) -> Result<bool, StorageError> {
        match self.actions.get_mut(id) {
            Some(mut entry) => {
                entry.value_mut().1.retry_count = retry_count;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_action(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.actions.remove(id).is_some())
    }

    async fn count_actions(&self) -> Result<u64, StorageError> {
        Ok(self.actions.len() as u64)
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.cache.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.cache.get(key).map(|r| r.value().clone()))
    }

    async fn delete_cache(&self, key: &str) -> Result<(), StorageError> {
        self.cache.remove(key);
        Ok(())
    }

    async fn sweep_cache(&self, now_ms: i64) -> Result<u64, StorageError> {
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.is_expired_at(now_ms));
        // Inserts may land mid-retain, so the map can grow under us.
        Ok(before.saturating_sub(self.cache.len()) as u64)
    }

    async fn save_sync_queue(&self, items: &[SyncQueueItem]) -> Result<(), StorageError> {
        *self.sync_queue.write() = items.to_vec();
        Ok(())
    }

    async fn load_sync_queue(&self) -> Result<Vec<SyncQueueItem>, StorageError> {
        Ok(self.sync_queue.read().clone())
    }
}
