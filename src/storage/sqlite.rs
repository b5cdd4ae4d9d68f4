// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed [`DurableStore`].
//!
//! Three tables on one embedded database file:
//! ```sql
//! offline_actions (id TEXT PK, action_type, payload, enqueued_at, retry_count, max_retries)
//! offline_cache   (cache_key TEXT PK, data, cached_at, expires_at)
//! sync_queue      (position INTEGER PK, id, operation, table_name, data, status, ...)
//! ```
//!
//! Payloads are JSON serialized into TEXT columns (the sqlx `Any` driver has
//! no portable JSON type). Replay order for actions is
//! `ORDER BY enqueued_at, rowid` so same-millisecond enqueues stay FIFO.
//! Queries are wrapped in a short retry to ride out `SQLITE_BUSY` windows.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{DurableStore, StorageError};
use crate::record::{CacheEntry, Operation, PersistedAction, SyncQueueItem, SyncStatus};
use crate::retry::{retry, RetryError, RetryPolicy};

// sqlx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn to_backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn is_transient(err: &StorageError) -> bool {
    matches!(err, StorageError::Backend(_))
}

async fn with_retry<T, F, Fut>(name: &'static str, op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let _timer = crate::metrics::LatencyTimer::new("storage", name);
    retry(name, &RetryPolicy::storage(), is_transient, op)
        .await
        .map_err(RetryError::into_inner)
}

pub struct SqliteStore {
    pool: AnyPool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path`, which may be a
    /// bare file path or a full `sqlite:` URL.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        install_drivers();

        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        // A :memory: database exists per connection; keep the pool at one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = {
            let url = url.clone();
            with_retry("storage.connect", move || {
                let url = url.clone();
                async move {
                    AnyPoolOptions::new()
                        .max_connections(max_connections)
                        .acquire_timeout(Duration::from_secs(10))
                        .connect(&url)
                        .await
                        .map_err(to_backend)
                }
            })
            .await?
        };

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// WAL keeps readers unblocked during writes; NORMAL sync is safe in
    /// WAL mode and avoids the second fsync.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS offline_actions (
                id TEXT PRIMARY KEY,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_offline_actions_enqueued \
             ON offline_actions(enqueued_at)",
            r#"
            CREATE TABLE IF NOT EXISTS offline_cache (
                cache_key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_offline_cache_expires \
             ON offline_cache(expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                position INTEGER PRIMARY KEY,
                id TEXT NOT NULL,
                operation TEXT NOT NULL,
                table_name TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        ];

        for sql in statements {
            let pool = self.pool.clone();
            with_retry("storage.init_schema", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query(sql).execute(&pool).await.map_err(to_backend)?;
                    Ok(())
                }
            })
            .await?;
        }
        Ok(())
    }
}

fn action_from_row(row: &AnyRow) -> Result<PersistedAction, StorageError> {
    let payload_text: String = row.try_get("payload").map_err(to_backend)?;
    Ok(PersistedAction {
        id: row.try_get("id").map_err(to_backend)?,
        action_type: row.try_get("action_type").map_err(to_backend)?,
        payload: serde_json::from_str(&payload_text)?,
        enqueued_at: row.try_get("enqueued_at").map_err(to_backend)?,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(to_backend)? as u32,
        max_retries: row.try_get::<i64, _>("max_retries").map_err(to_backend)? as u32,
    })
}

fn cache_from_row(row: &AnyRow) -> Result<CacheEntry, StorageError> {
    let data_text: String = row.try_get("data").map_err(to_backend)?;
    Ok(CacheEntry {
        key: row.try_get("cache_key").map_err(to_backend)?,
        data: serde_json::from_str(&data_text)?,
        cached_at: row.try_get("cached_at").map_err(to_backend)?,
        expires_at: row.try_get("expires_at").map_err(to_backend)?,
    })
}

fn sync_item_from_row(row: &AnyRow) -> Result<SyncQueueItem, StorageError> {
    let operation_text: String = row.try_get("operation").map_err(to_backend)?;
    let status_text: String = row.try_get("status").map_err(to_backend)?;
    let data_text: String = row.try_get("data").map_err(to_backend)?;
    let operation: Operation = operation_text
        .parse()
        .map_err(StorageError::Serialization)?;
    let status: SyncStatus = status_text.parse().map_err(StorageError::Serialization)?;
    Ok(SyncQueueItem {
        id: row.try_get("id").map_err(to_backend)?,
        operation,
        table: row.try_get("table_name").map_err(to_backend)?,
        data: serde_json::from_str(&data_text)?,
        status,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(to_backend)? as u32,
        max_retries: row.try_get::<i64, _>("max_retries").map_err(to_backend)? as u32,
        enqueued_at: row.try_get("enqueued_at").map_err(to_backend)?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn append_action(&self, action: &PersistedAction) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&action.payload)?;
        let pool = self.pool.clone();
        let action = action.clone();
        with_retry("storage.append_action", move || {
            let pool = pool.clone();
            let action = action.clone();
            let payload = payload.clone();
            async move {
                sqlx::query(
                    "INSERT INTO offline_actions \
                     (id, action_type, payload, enqueued_at, retry_count, max_retries) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&action.id)
                .bind(&action.action_type)
                .bind(&payload)
                .bind(action.enqueued_at)
                .bind(action.retry_count as i64)
                .bind(action.max_retries as i64)
                .execute(&pool)
                .await
                .map_err(to_backend)?;
                Ok(())
            }
        })
        .await
    }

    async fn get_action(&self, id: &str) -> Result<Option<PersistedAction>, StorageError> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let row = with_retry("storage.get_action", move || {
            let pool = pool.clone();
            let id = id.clone();
            async move {
                sqlx::query(
                    "SELECT id, action_type, payload, enqueued_at, retry_count, max_retries \
                     FROM offline_actions WHERE id = ?",
                )
                .bind(&id)
                .fetch_optional(&pool)
                .await
                .map_err(to_backend)
            }
        })
        .await?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn list_actions(&self) -> Result<Vec<PersistedAction>, StorageError> {
        let pool = self.pool.clone();
        let rows = with_retry("storage.list_actions", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "SELECT id, action_type, payload, enqueued_at, retry_count, max_retries \
                     FROM offline_actions ORDER BY enqueued_at ASC, rowid ASC",
                )
                .fetch_all(&pool)
                .await
                .map_err(to_backend)
            }
        })
        .await?;
        rows.iter().map(action_from_row).collect()
    }

    async fn update_action_retries(
        &self,
        id: &str,
        retry_count: u32,
    ) -> Result<bool, StorageError> {
        let pool = self.pool.clone();
        let id = id.to_string();
        with_retry("storage.update_action_retries", move || {
            let pool = pool.clone();
            let id = id.clone();
            async move {
                let result = sqlx::query("UPDATE offline_actions SET retry_count = ? WHERE id = ?")
                    .bind(retry_count as i64)
                    .bind(&id)
                    .execute(&pool)
                    .await
                    .map_err(to_backend)?;
                Ok(result.rows_affected() > 0)
            }
        })
        .await
    }

    async fn delete_action(&self, id: &str) -> Result<bool, StorageError> {
        let pool = self.pool.clone();
        let id = id.to_string();
        with_retry("storage.delete_action", move || {
            let pool = pool.clone();
            let id = id.clone();
            async move {
                let result = sqlx::query("DELETE FROM offline_actions WHERE id = ?")
                    .bind(&id)
                    .execute(&pool)
                    .await
                    .map_err(to_backend)?;
                Ok(result.rows_affected() > 0)
            }
        })
        .await
    }

    async fn count_actions(&self) -> Result<u64, StorageError> {
        let pool = self.pool.clone();
        with_retry("storage.count_actions", move || {
            let pool = pool.clone();
            async move {
                let row = sqlx::query("SELECT COUNT(*) AS n FROM offline_actions")
                    .fetch_one(&pool)
                    .await
                    .map_err(to_backend)?;
                let n: i64 = row.try_get("n").map_err(to_backend)?;
                Ok(n as u64)
            }
        })
        .await
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let data = serde_json::to_string(&entry.data)?;
        let pool = self.pool.clone();
        let entry = entry.clone();
        with_retry("storage.put_cache", move || {
            let pool = pool.clone();
            let entry = entry.clone();
            let data = data.clone();
            async move {
                sqlx::query(
                    "INSERT INTO offline_cache (cache_key, data, cached_at, expires_at) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(cache_key) DO UPDATE SET \
                     data = excluded.data, \
                     cached_at = excluded.cached_at, \
                     expires_at = excluded.expires_at",
                )
                .bind(&entry.key)
                .bind(&data)
                .bind(entry.cached_at)
                .bind(entry.expires_at)
                .execute(&pool)
                .await
                .map_err(to_backend)?;
                Ok(())
            }
        })
        .await
    }

    async fn get_cache(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let row = with_retry("storage.get_cache", move || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                sqlx::query(
                    "SELECT cache_key, data, cached_at, expires_at \
                     FROM offline_cache WHERE cache_key = ?",
                )
                .bind(&key)
                .fetch_optional(&pool)
                .await
                .map_err(to_backend)
            }
        })
        .await?;
        row.as_ref().map(cache_from_row).transpose()
    }

    async fn delete_cache(&self, key: &str) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        with_retry("storage.delete_cache", move || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                sqlx::query("DELETE FROM offline_cache WHERE cache_key = ?")
                    .bind(&key)
                    .execute(&pool)
                    .await
                    .map_err(to_backend)?;
                Ok(())
            }
        })
        .await
    }

    async fn sweep_cache(&self, now_ms: i64) -> Result<u64, StorageError> {
        let pool = self.pool.clone();
        with_retry("storage.sweep_cache", move || {
            let pool = pool.clone();
            async move {
                let result = sqlx::query("DELETE FROM offline_cache WHERE expires_at <= ?")
                    .bind(now_ms)
                    .execute(&pool)
                    .await
                    .map_err(to_backend)?;
                Ok(result.rows_affected())
            }
        })
        .await
    }

    async fn save_sync_queue(&self, items: &[SyncQueueItem]) -> Result<(), StorageError> {
        // Serialize outside the transaction; bind errors should not burn
        // retries.
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            rows.push((
                item.id.clone(),
                item.operation.as_str().to_string(),
                item.table.clone(),
                serde_json::to_string(&item.data)?,
                item.status.as_str().to_string(),
                item.retry_count as i64,
                item.max_retries as i64,
                item.enqueued_at,
            ));
        }
        let rows = std::sync::Arc::new(rows);
        let pool = self.pool.clone();

        with_retry("storage.save_sync_queue", move || {
            let pool = pool.clone();
            let rows = rows.clone();
            async move {
                let mut tx = pool.begin().await.map_err(to_backend)?;
                sqlx::query("DELETE FROM sync_queue")
                    .execute(&mut *tx)
                    .await
                    .map_err(to_backend)?;
                for (position, row) in rows.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO sync_queue \
                         (position, id, operation, table_name, data, status, \
                          retry_count, max_retries, enqueued_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(position as i64)
                    .bind(&row.0)
                    .bind(&row.1)
                    .bind(&row.2)
                    .bind(&row.3)
                    .bind(&row.4)
                    .bind(row.5)
                    .bind(row.6)
                    .bind(row.7)
                    .execute(&mut *tx)
                    .await
                    .map_err(to_backend)?;
                }
                tx.commit().await.map_err(to_backend)?;
                Ok(())
            }
        })
        .await
    }

    async fn load_sync_queue(&self) -> Result<Vec<SyncQueueItem>, StorageError> {
        let pool = self.pool.clone();
        let rows = with_retry("storage.load_sync_queue", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "SELECT id, operation, table_name, data, status, \
                     retry_count, max_retries, enqueued_at \
                     FROM sync_queue ORDER BY position ASC",
                )
                .fetch_all(&pool)
                .await
                .map_err(to_backend)
            }
        })
        .await?;
        rows.iter().map(sync_item_from_row).collect()
    }
}
