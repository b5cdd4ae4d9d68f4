//! Durable storage backends.
//!
//! [`SqliteStore`] is the production backend (embedded, WAL mode, survives
//! restarts). [`MemoryStore`] backs tests and cache-only deployments where
//! durability across restarts is not needed.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{DurableStore, StorageError};
