//! # Offline Engine
//!
//! A client-side resilience engine for applications that must keep working
//! over flaky, high-latency or absent connectivity.
//!
//! ## Architecture
//!
//! Every component hangs off the connection monitor; requests flow down,
//! durable state flows to the store at the bottom:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        OfflineEngine                        │
//! │  • Facade: construction, lifecycle, health reporting        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ConnectionMonitor                      │
//! │  • Online/offline and link quality from platform signals    │
//! │  • Adaptive timeouts, retry with exponential backoff        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RequestDispatcher                      │
//! │  • Five priority bands with bounded concurrency             │
//! │  • Concurrency cap follows the link quality                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          OfflineQueue + SyncManager + SyncScheduler         │
//! │  • Durable action replay, TTL cache, CRUD sync queue        │
//! │  • Cadence adapts to quality, backlog, battery, focus       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                DurableStore (SQLite / memory)               │
//! │  • Actions, cache and sync queue survive restarts           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_engine::{
//!     EngineConfig, ManualSignals, MockTransport, OfflineEngine, Priority, RequestOptions,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     // In production the transport wraps your HTTP client and the
//!     // signal source bridges the platform's connectivity events.
//!     let transport = Arc::new(MockTransport::new());
//!     let signals = ManualSignals::new();
//!
//!     let config = EngineConfig {
//!         db_path: Some("offline.db".into()),
//!         ..Default::default()
//!     };
//!     let engine = OfflineEngine::new(config, transport, &signals)
//!         .await
//!         .expect("failed to open store");
//!     engine.start().await;
//!
//!     // Fire-and-forget mutation; survives restarts, replays when the
//!     // link allows.
//!     engine
//!         .queue()
//!         .queue_action("vessel/position", json!({"lat": 57.3, "lon": -2.1}))
//!         .await
//!         .expect("failed to queue");
//!
//!     // Prioritised read through the dispatcher.
//!     let handle = engine
//!         .dispatcher()
//!         .enqueue("fleet/status", RequestOptions::get(), Priority::High);
//!     if let Ok(response) = handle.wait().await {
//!         println!("fleet status: {}", response.body);
//!     }
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Connection Awareness**: online/offline plus 2g/3g/4g classification drives timeouts and concurrency
//! - **Exponential Backoff**: jittered retry for transient failures, per-call policy overrides
//! - **Priority Dispatch**: five bands from `Critical` to `Background`; overflow evicts background work first
//! - **Durable Offline Queue**: mutations persist while offline and replay FIFO when the link returns
//! - **TTL Cache**: reads served locally until entries expire, lazily and periodically swept
//! - **Adaptive Sync Cadence**: interval stretches on poor links, battery saver and hidden apps
//! - **Dead Lettering**: actions that exhaust their retry budget surface on a broadcast channel
//!
//! ## Configuration
//!
//! See [`EngineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`engine`]: The [`OfflineEngine`] facade owning all components
//! - [`connection`]: Link monitoring, quality classification, adaptive fetch
//! - [`dispatcher`]: Priority-banded request dispatch
//! - [`queue`]: Durable action queue and TTL cache
//! - [`sync`]: CRUD sync queue and replay passes
//! - [`scheduler`]: Adaptive background sync cadence
//! - [`retry`]: Backoff policies and the generic retry loop
//! - [`storage`]: SQLite and in-memory stores
//! - [`transport`]: The host transport seam and a scripted mock

pub mod config;
pub mod error;
pub mod record;
pub mod retry;
pub mod transport;
pub mod connection;
pub mod storage;
pub mod queue;
pub mod sync;
pub mod dispatcher;
pub mod scheduler;
pub mod engine;
pub mod metrics;

pub use config::EngineConfig;
pub use connection::{
    ConnectionMonitor, ConnectionState, LinkHints, ManualSignals, PlatformSignals, QualityClass,
    SignalEvent,
};
pub use dispatcher::{
    DispatchHandle, DispatchOptions, DispatcherConfig, DispatcherStatus, Priority,
    RequestDispatcher, TaskState,
};
pub use engine::{EngineHealth, EngineState, OfflineEngine};
pub use error::FetchError;
pub use metrics::LatencyTimer;
pub use queue::{DeadLetter, OfflineQueue};
pub use record::{CacheEntry, Operation, PersistedAction, SyncQueueItem, SyncStatus};
pub use retry::{retry, RetryError, RetryPolicy};
pub use scheduler::{compute_interval, SchedulerConfig, SchedulerStatus, SyncScheduler};
pub use storage::{DurableStore, MemoryStore, SqliteStore, StorageError};
pub use sync::{QueueStatus, SyncManager, SyncReport};
pub use transport::{MockTransport, RequestOptions, Response, Transport};
