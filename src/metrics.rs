// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the host app
//! chooses the exporter (Prometheus, OTEL, or none at all).
//!
//! # Metric Naming Convention
//! - `offline_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: success, timeout, transport, remote, no_connection, ...
//! - `operation`: retry loop / storage operation names
//! - `priority`: critical, high, medium, low, background

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::connection::ConnectionState;

// ═══════════════════════════════════════════════════════════════════════════
// FETCH AND RETRY - Wire attempts and backoff loops
// ═══════════════════════════════════════════════════════════════════════════

/// Record one fetch outcome (success or the error label)
pub fn record_fetch(outcome: &str) {
    counter!(
        "offline_engine_fetches_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record fetch latency, timeouts included
pub fn record_fetch_latency(duration: Duration) {
    histogram!("offline_engine_fetch_seconds").record(duration.as_secs_f64());
}

/// Record a retry attempt inside a named backoff loop
pub fn record_retry_attempt(operation: &str) {
    counter!(
        "offline_engine_retry_attempts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a backoff loop giving up
pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "offline_engine_retry_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION - Link state gauges
// ═══════════════════════════════════════════════════════════════════════════

/// Set connection gauges from a state snapshot
pub fn set_connection(state: &ConnectionState) {
    gauge!("offline_engine_online").set(if state.is_online { 1.0 } else { 0.0 });
    // Quality rank 0-3; -1 when the platform reports nothing
    gauge!("offline_engine_link_quality")
        .set(state.quality.rank().map(|r| r as f64).unwrap_or(-1.0));
    gauge!("offline_engine_downlink_mbps").set(state.downlink_mbps);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE AND CACHE - Durable actions and TTL cache
// ═══════════════════════════════════════════════════════════════════════════

/// Record an action dropped after exhausting its retry budget
pub fn record_dead_letter(action_type: &str) {
    counter!(
        "offline_engine_dead_letters_total",
        "action_type" => action_type.to_string()
    )
    .increment(1);
}

/// Record a cache lookup outcome (hit, miss, expired)
pub fn record_cache(outcome: &str) {
    counter!(
        "offline_engine_cache_lookups_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the durable action backlog gauge
pub fn set_pending_actions(count: u64) {
    gauge!("offline_engine_pending_actions").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// DISPATCH - Priority queue pressure
// ═══════════════════════════════════════════════════════════════════════════

/// Record a task entering the dispatcher
pub fn record_dispatch(priority: &str) {
    counter!(
        "offline_engine_dispatches_total",
        "priority" => priority.to_string()
    )
    .increment(1);
}

/// Record load shedding (evicted background task or rejected newcomer)
pub fn record_eviction(reason: &str) {
    counter!(
        "offline_engine_load_shed_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set the waiting-task gauge
pub fn set_dispatch_depth(depth: usize) {
    gauge!("offline_engine_dispatch_queue_depth").set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC - Pass cadence
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed sync pass and its duration
pub fn record_sync_pass(duration: Duration) {
    counter!("offline_engine_sync_passes_total").increment(1);
    histogram!("offline_engine_sync_pass_seconds").record(duration.as_secs_f64());
}

/// Set the currently scheduled sync interval
pub fn set_sync_interval(interval: Duration) {
    gauge!("offline_engine_sync_interval_seconds").set(interval.as_secs_f64());
}

/// Record an engine lifecycle transition
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "offline_engine_operation_seconds",
            "component" => self.component,
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
