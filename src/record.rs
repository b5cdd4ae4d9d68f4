//! Core record types persisted by the storage layer.
//!
//! Everything here survives a process restart; the rest of the engine is
//! rebuilt from these records at startup. Payloads are opaque JSON; the
//! engine transports them without inspecting business semantics.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default retry budget for durable actions and sync queue items.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Milliseconds since the unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A mutation intent captured while offline (or queued for replay), kept in
/// durable storage until confirmed or dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAction {
    pub id: String,
    /// Replay target; treated as the transport destination for the payload.
    pub action_type: String,
    pub payload: Value,
    /// Unix millis at enqueue; replay order is ascending on this field.
    pub enqueued_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl PersistedAction {
    pub fn new(action_type: impl Into<String>, payload: Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            payload,
            enqueued_at: now_ms(),
            retry_count: 0,
            max_retries,
        }
    }
}

/// A cached response value with absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub cached_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, data: Value, ttl: Duration) -> Self {
        let cached_at = now_ms();
        Self {
            key: key.into(),
            data,
            cached_at,
            expires_at: cached_at.saturating_add(ttl.as_millis() as i64),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// The kind of record mutation a [`SyncQueueItem`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Transport verb used when pushing the mutation upstream.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Insert => "POST",
            Operation::Update => "PATCH",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Lifecycle of a [`SyncQueueItem`].
///
/// `Failed` is terminal: a failed item is never picked up by a sync pass
/// again until an explicit manual retry resets it to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// A status-tracked record mutation managed by the sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub operation: Operation,
    pub table: String,
    pub data: Value,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub enqueued_at: i64,
}

impl SyncQueueItem {
    pub fn new(operation: Operation, table: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            table: table.into(),
            data,
            status: SyncStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            enqueued_at: now_ms(),
        }
    }
}
