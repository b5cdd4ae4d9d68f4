use async_trait::async_trait;
use thiserror::Error;

use crate::record::{CacheEntry, PersistedAction, SyncQueueItem};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// The durable medium behind the offline queue, the TTL cache, and the sync
/// manager's snapshot. One medium, three logical stores.
///
/// Implementations provide at-least-once durability across process restarts;
/// policy (retry budgets, dead-letters, lazy expiry) lives above this trait
/// in [`crate::queue::OfflineQueue`].
#[async_trait]
pub trait DurableStore: Send + Sync {
    // --- action log ---

    /// Append one action. Ids are unique; appending an existing id is a
    /// backend error.
    async fn append_action(&self, action: &PersistedAction) -> Result<(), StorageError>;

    async fn get_action(&self, id: &str) -> Result<Option<PersistedAction>, StorageError>;

    /// All actions ordered by enqueue time ascending, insertion order as the
    /// tie-break. This is the replay order.
    async fn list_actions(&self) -> Result<Vec<PersistedAction>, StorageError>;

    /// Persist a new retry count. Returns false when the id is gone.
    async fn update_action_retries(&self, id: &str, retry_count: u32)
        -> Result<bool, StorageError>;

    /// Returns false when the id was already gone.
    async fn delete_action(&self, id: &str) -> Result<bool, StorageError>;

    async fn count_actions(&self) -> Result<u64, StorageError>;

    // --- cache table ---

    /// Insert or replace the entry for `entry.key`.
    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError>;

    /// Read an entry regardless of expiry; expiry policy is the caller's.
    async fn get_cache(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    async fn delete_cache(&self, key: &str) -> Result<(), StorageError>;

    /// Delete every entry with `expires_at <= now_ms`; returns the count.
    async fn sweep_cache(&self, now_ms: i64) -> Result<u64, StorageError>;

    // --- sync-queue snapshot ---

    /// Replace the whole snapshot, preserving item order.
    async fn save_sync_queue(&self, items: &[SyncQueueItem]) -> Result<(), StorageError>;

    /// Load the snapshot in the order it was saved.
    async fn load_sync_queue(&self) -> Result<Vec<SyncQueueItem>, StorageError>;
}
