//! Configuration for the offline engine.
//!
//! # Example
//!
//! ```
//! use offline_engine::EngineConfig;
//!
//! // Minimal config (uses defaults, in-memory storage)
//! let config = EngineConfig::default();
//! assert_eq!(config.max_concurrent, 4);
//!
//! // Full config
//! let config = EngineConfig {
//!     db_path: Some("offline.db".into()),
//!     max_concurrent: 2,
//!     retry_max_retries: 5,
//!     min_sync_interval_secs: 30,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::DispatcherConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;

/// Configuration for the offline engine.
///
/// All fields have sensible defaults. Set `db_path` for durable storage;
/// without it, queued actions live in memory and die with the process.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path (file path or `sqlite:` URL)
    #[serde(default)]
    pub db_path: Option<String>,

    /// Dispatcher limits
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Backoff for retryable fetches
    #[serde(default = "default_retry_max_retries")]
    pub retry_max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Sync cadence bounds
    #[serde(default = "default_min_sync_interval_secs")]
    pub min_sync_interval_secs: u64,
    #[serde(default = "default_max_sync_interval_secs")]
    pub max_sync_interval_secs: u64,

    /// Backlog size that forces an immediate sync
    #[serde(default = "default_urgent_threshold")]
    pub urgent_threshold: u64,

    /// Replay budget for queued offline actions
    #[serde(default = "default_action_max_retries")]
    pub action_max_retries: u32,

    /// Cache sweep cadence (0 = disabled)
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
}

fn default_max_concurrent() -> usize { 4 }
fn default_max_queue_size() -> usize { 100 }
fn default_default_timeout_ms() -> u64 { 15_000 } // 15 s
fn default_retry_max_retries() -> u32 { 3 }
fn default_retry_initial_delay_ms() -> u64 { 1_000 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_min_sync_interval_secs() -> u64 { 10 }
fn default_max_sync_interval_secs() -> u64 { 300 } // 5 min
fn default_urgent_threshold() -> u64 { 10 }
fn default_action_max_retries() -> u32 { 3 }
fn default_cache_sweep_interval_secs() -> u64 { 60 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            default_timeout_ms: default_default_timeout_ms(),
            retry_max_retries: default_retry_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            min_sync_interval_secs: default_min_sync_interval_secs(),
            max_sync_interval_secs: default_max_sync_interval_secs(),
            urgent_threshold: default_urgent_threshold(),
            action_max_retries: default_action_max_retries(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// The backoff policy for retryable fetches.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }

    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue_size,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            retry_policy: self.retry_policy(),
        }
    }

    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_interval: Duration::from_secs(self.min_sync_interval_secs),
            max_interval: Duration::from_secs(self.max_sync_interval_secs),
            urgent_threshold: self.urgent_threshold,
        }
    }
}
