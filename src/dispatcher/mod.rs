// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority request dispatcher with bounded concurrency.
//!
//! Requests queue in five priority bands (FIFO within a band) and at most
//! `max_concurrent` run at once. A full queue evicts the oldest background
//! task to make room, or rejects the newcomer when no background task is
//! waiting. Failed attempts with budget left re-enter at the front of their
//! band after a backoff delay. Running tasks are never aborted by pause or
//! concurrency changes; both only gate what starts next.

pub mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMonitor, QualityClass};
use crate::error::FetchError;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::transport::RequestOptions;

use task::QueuedTask;

pub use task::{DispatchHandle, DispatchOptions, Priority, TaskState};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub default_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 100,
            default_timeout: Duration::from_secs(15),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStatus {
    pub waiting: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub paused: bool,
    /// Waiting tasks per band, indexed by [`Priority::band`].
    pub waiting_by_priority: [usize; 5],
}

struct DispatchState {
    waiting: Vec<QueuedTask>,
    active: usize,
    max_concurrent: usize,
    paused: bool,
}

struct DispatcherInner {
    monitor: ConnectionMonitor,
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    next_id: AtomicU64,
}

/// Cheap-to-clone handle to the dispatcher.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    pub fn new(monitor: ConnectionMonitor, config: DispatcherConfig) -> Self {
        let max_concurrent = config.max_concurrent;
        Self {
            inner: Arc::new(DispatcherInner {
                monitor,
                config,
                state: Mutex::new(DispatchState {
                    waiting: Vec::new(),
                    active: 0,
                    max_concurrent,
                    paused: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues a request at `priority` with the dispatcher's default retry
    /// policy and timeout. Must be called from within a tokio runtime.
    pub fn enqueue(
        &self,
        target: impl Into<String>,
        options: RequestOptions,
        priority: Priority,
    ) -> DispatchHandle {
        self.enqueue_with(target, options, priority, DispatchOptions::default())
    }

    pub fn enqueue_with(
        &self,
        target: impl Into<String>,
        options: RequestOptions,
        priority: Priority,
        opts: DispatchOptions,
    ) -> DispatchHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let policy = opts
            .policy
            .unwrap_or_else(|| self.inner.config.retry_policy.clone());
        let mut incoming = QueuedTask::new(id, target, options, priority, policy, opts.timeout, tx);
        metrics::record_dispatch(priority.as_str());

        {
            let mut state = self.inner.state.lock();
            if state.waiting.len() >= self.inner.config.max_queue_size {
                // Background work is the load-shedding victim; everything
                // else bounces the newcomer instead.
                match state
                    .waiting
                    .iter()
                    .position(|t| t.priority == Priority::Background)
                {
                    Some(pos) => {
                        let mut evicted = state.waiting.remove(pos);
                        evicted.advance(TaskState::Failed);
                        evicted.resolve(Err(FetchError::QueueOverflow));
                        warn!(
                            id = evicted.id,
                            target = %evicted.target,
                            "queue full, evicted oldest background task"
                        );
                        metrics::record_eviction("evicted");
                    }
                    None => {
                        incoming.advance(TaskState::Failed);
                        incoming.resolve(Err(FetchError::QueueOverflow));
                        warn!(id, target = %incoming.target, "queue full, rejecting task");
                        metrics::record_eviction("rejected");
                        return DispatchHandle { id, rx };
                    }
                }
            }

            let pos = insert_position(&state.waiting, priority);
            debug!(
                id,
                target = %incoming.target,
                priority = priority.as_str(),
                position = pos,
                "task queued"
            );
            state.waiting.insert(pos, incoming);
            metrics::set_dispatch_depth(state.waiting.len());
        }

        drain(&self.inner);
        DispatchHandle { id, rx }
    }

    /// Cancels the first waiting task for `target`. Running tasks are not
    /// touched. Returns whether anything was cancelled.
    pub fn cancel(&self, target: &str) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            state
                .waiting
                .iter()
                .position(|t| t.target == target)
                .map(|pos| state.waiting.remove(pos))
        };
        match task {
            Some(mut task) => {
                task.advance(TaskState::Failed);
                task.resolve(Err(FetchError::Cancelled));
                debug!(id = task.id, target, "cancelled waiting task");
                true
            }
            None => false,
        }
    }

    /// Cancels every waiting task in `priority`'s band, returning the count.
    pub fn cancel_by_priority(&self, priority: Priority) -> usize {
        let removed: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            let mut kept = Vec::with_capacity(state.waiting.len());
            let mut removed = Vec::new();
            for task in state.waiting.drain(..) {
                if task.priority == priority {
                    removed.push(task);
                } else {
                    kept.push(task);
                }
            }
            state.waiting = kept;
            removed
        };
        let count = removed.len();
        for mut task in removed {
            task.advance(TaskState::Failed);
            task.resolve(Err(FetchError::Cancelled));
        }
        if count > 0 {
            debug!(count, priority = priority.as_str(), "cancelled waiting tasks by priority");
        }
        count
    }

    /// Stops starting new tasks. In-flight tasks run to completion and
    /// nothing waiting is discarded.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("dispatcher paused");
    }

    pub fn resume(&self) {
        {
            self.inner.state.lock().paused = false;
        }
        info!("dispatcher resumed");
        drain(&self.inner);
    }

    /// Adapts the concurrency cap to the link quality and returns the new
    /// cap. Lowering the cap never aborts running tasks; it only delays
    /// starts until enough of them finish.
    pub fn adjust_concurrency(&self, quality: QualityClass) -> usize {
        let target = match quality {
            QualityClass::Slow2g | QualityClass::TwoG => 2,
            QualityClass::ThreeG => 3,
            QualityClass::FourG | QualityClass::Unknown => self.inner.config.max_concurrent,
        };
        let changed = {
            let mut state = self.inner.state.lock();
            if state.max_concurrent == target {
                false
            } else {
                info!(
                    from = state.max_concurrent,
                    to = target,
                    quality = quality.as_str(),
                    "adjusted dispatcher concurrency"
                );
                state.max_concurrent = target;
                true
            }
        };
        if changed {
            drain(&self.inner);
        }
        target
    }

    #[must_use]
    pub fn status(&self) -> DispatcherStatus {
        let state = self.inner.state.lock();
        let mut waiting_by_priority = [0usize; 5];
        for task in &state.waiting {
            waiting_by_priority[task.priority.band()] += 1;
        }
        DispatcherStatus {
            waiting: state.waiting.len(),
            active: state.active,
            max_concurrent: state.max_concurrent,
            paused: state.paused,
            waiting_by_priority,
        }
    }

    /// Pauses and cancels everything waiting. Running tasks still finish;
    /// their results go to handles as usual. Returns how many waiting tasks
    /// were cancelled.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            state.paused = true;
            state.waiting.drain(..).collect()
        };
        let count = drained.len();
        for mut task in drained {
            task.advance(TaskState::Failed);
            task.resolve(Err(FetchError::Cancelled));
        }
        if count > 0 {
            info!(cancelled = count, "dispatcher shut down with tasks waiting");
        }
        count
    }
}

/// Insertion point for a new task: after every task of the same or higher
/// urgency, keeping bands contiguous and FIFO.
fn insert_position(waiting: &[QueuedTask], priority: Priority) -> usize {
    waiting
        .iter()
        .position(|t| t.priority.band() > priority.band())
        .unwrap_or(waiting.len())
}

/// Re-insertion point for a retrying task: the front of its own band, ahead
/// of same-priority work that has not failed yet.
fn retry_position(waiting: &[QueuedTask], priority: Priority) -> usize {
    waiting
        .iter()
        .position(|t| t.priority.band() >= priority.band())
        .unwrap_or(waiting.len())
}

/// Starts waiting tasks until the concurrency cap is hit, the queue is
/// empty, or the dispatcher is paused.
fn drain(inner: &Arc<DispatcherInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            if state.paused || state.active >= state.max_concurrent || state.waiting.is_empty() {
                return;
            }
            let mut task = state.waiting.remove(0);
            task.advance(TaskState::Running);
            state.active += 1;
            metrics::set_dispatch_depth(state.waiting.len());
            task
        };
        let inner = inner.clone();
        tokio::spawn(run_task(inner, task));
    }
}

async fn run_task(inner: Arc<DispatcherInner>, mut task: QueuedTask) {
    let timeout = task.timeout.unwrap_or(inner.config.default_timeout);
    let result = inner
        .monitor
        .fetch_with_timeout(&task.target, &task.options, Some(timeout))
        .await;

    match result {
        Ok(response) => {
            task.advance(TaskState::Succeeded);
            task.resolve(Ok(response));
            finish_one(&inner);
        }
        Err(err) if err.is_retryable() && task.retries < task.policy.max_retries => {
            task.retries += 1;
            let delay = task.policy.delay_with_jitter(task.retries - 1);
            debug!(
                id = task.id,
                target = %task.target,
                attempt = task.retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "task attempt failed, retry scheduled"
            );
            task.advance(TaskState::RetryScheduled);
            let requeue_inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                requeue(&requeue_inner, task);
            });
            finish_one(&inner);
        }
        Err(err) => {
            // Only a spent retry budget counts as exhaustion; a non-retryable
            // error resolves as-is, however many retries preceded it.
            let exhausted = err.is_retryable() && task.retries == task.policy.max_retries;
            let final_err = if exhausted {
                FetchError::RetryExhausted {
                    attempts: task.retries + 1,
                    source: Box::new(err),
                }
            } else {
                err
            };
            warn!(id = task.id, target = %task.target, error = %final_err, "task failed");
            task.advance(TaskState::Failed);
            task.resolve(Err(final_err));
            finish_one(&inner);
        }
    }
}

fn finish_one(inner: &Arc<DispatcherInner>) {
    {
        let mut state = inner.state.lock();
        state.active = state.active.saturating_sub(1);
    }
    drain(inner);
}

fn requeue(inner: &Arc<DispatcherInner>, mut task: QueuedTask) {
    {
        let mut state = inner.state.lock();
        task.advance(TaskState::Pending);
        let pos = retry_position(&state.waiting, task.priority);
        state.waiting.insert(pos, task);
        metrics::set_dispatch_depth(state.waiting.len());
    }
    drain(inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::signals::ManualSignals;
    use crate::transport::MockTransport;

    fn rig(config: DispatcherConfig) -> (Arc<MockTransport>, RequestDispatcher) {
        let transport = Arc::new(MockTransport::new());
        let signals = ManualSignals::new();
        let monitor = ConnectionMonitor::new(transport.clone(), &signals);
        (transport, RequestDispatcher::new(monitor, config))
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            retry_policy: RetryPolicy::test(),
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn serial_dispatch_runs_bands_in_priority_order() {
        let (transport, dispatcher) = rig(DispatcherConfig {
            max_concurrent: 1,
            ..quick_config()
        });

        dispatcher.pause();
        let low = dispatcher.enqueue("low", RequestOptions::get(), Priority::Low);
        let critical = dispatcher.enqueue("critical", RequestOptions::get(), Priority::Critical);
        let medium = dispatcher.enqueue("medium", RequestOptions::get(), Priority::Medium);
        dispatcher.resume();

        low.wait().await.unwrap();
        critical.wait().await.unwrap();
        medium.wait().await.unwrap();

        assert_eq!(transport.call_order(), vec!["critical", "medium", "low"]);
    }

    #[tokio::test]
    async fn same_band_stays_fifo() {
        let (transport, dispatcher) = rig(DispatcherConfig {
            max_concurrent: 1,
            ..quick_config()
        });

        dispatcher.pause();
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|t| dispatcher.enqueue(t, RequestOptions::get(), Priority::Medium))
            .collect();
        dispatcher.resume();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(transport.call_order(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_requests() {
        let (transport, dispatcher) = rig(DispatcherConfig {
            max_concurrent: 2,
            ..quick_config()
        });
        transport.set_latency(Duration::from_millis(40));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                dispatcher.enqueue(
                    format!("task-{i}"),
                    RequestOptions::get(),
                    Priority::Background,
                )
            })
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(transport.max_in_flight(), 2);
        assert_eq!(transport.total_calls(), 5);
    }

    #[tokio::test]
    async fn overflow_evicts_the_oldest_background_task() {
        let (_transport, dispatcher) = rig(DispatcherConfig {
            max_queue_size: 2,
            ..quick_config()
        });

        dispatcher.pause();
        let bg_old = dispatcher.enqueue("bg-old", RequestOptions::get(), Priority::Background);
        let _bg_new = dispatcher.enqueue("bg-new", RequestOptions::get(), Priority::Background);
        let _high = dispatcher.enqueue("high", RequestOptions::get(), Priority::High);

        assert!(matches!(
            bg_old.wait().await,
            Err(FetchError::QueueOverflow)
        ));
        let status = dispatcher.status();
        assert_eq!(status.waiting, 2);
        assert_eq!(status.waiting_by_priority[Priority::High.band()], 1);
        assert_eq!(status.waiting_by_priority[Priority::Background.band()], 1);
    }

    #[tokio::test]
    async fn overflow_rejects_newcomer_when_nothing_is_evictable() {
        let (_transport, dispatcher) = rig(DispatcherConfig {
            max_queue_size: 2,
            ..quick_config()
        });

        dispatcher.pause();
        let first = dispatcher.enqueue("first", RequestOptions::get(), Priority::High);
        let second = dispatcher.enqueue("second", RequestOptions::get(), Priority::High);
        let rejected = dispatcher.enqueue("third", RequestOptions::get(), Priority::Critical);

        assert!(matches!(
            rejected.wait().await,
            Err(FetchError::QueueOverflow)
        ));
        assert_eq!(dispatcher.status().waiting, 2);

        dispatcher.resume();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
    }

    #[tokio::test]
    async fn retry_reenters_at_the_front_of_its_band() {
        let (transport, dispatcher) = rig(DispatcherConfig {
            max_concurrent: 1,
            ..quick_config()
        });
        transport.set_latency(Duration::from_millis(20));
        transport.script("flaky", vec![Err(FetchError::Remote { status: 503 })]);

        dispatcher.pause();
        let flaky = dispatcher.enqueue("flaky", RequestOptions::get(), Priority::Medium);
        let peer = dispatcher.enqueue("peer", RequestOptions::get(), Priority::Medium);
        let low = dispatcher.enqueue("low", RequestOptions::get(), Priority::Low);
        dispatcher.resume();

        flaky.wait().await.unwrap();
        peer.wait().await.unwrap();
        low.wait().await.unwrap();

        // flaky's retry (scheduled after ~1ms) jumps ahead of low but not
        // ahead of peer, which was already running.
        assert_eq!(
            transport.call_order(),
            vec!["flaky", "peer", "flaky", "low"]
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_is_immediate() {
        let (transport, dispatcher) = rig(quick_config());
        transport.script("missing", vec![Ok(crate::transport::Response::new(
            404,
            serde_json::Value::Null,
        ))]);

        let err = dispatcher
            .enqueue("missing", RequestOptions::get(), Priority::High)
            .wait()
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Remote { status: 404 }));
        assert_eq!(transport.calls("missing"), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_after_a_retry_stays_unwrapped() {
        let (transport, dispatcher) = rig(quick_config());
        transport.script(
            "profile",
            vec![
                Err(FetchError::Remote { status: 503 }),
                Err(FetchError::Remote { status: 404 }),
            ],
        );

        let err = dispatcher
            .enqueue("profile", RequestOptions::get(), Priority::High)
            .wait()
            .await
            .unwrap_err();

        // The 503 spent one retry, but stopping on the 404 is not
        // exhaustion; the handle sees the real error.
        assert!(matches!(err, FetchError::Remote { status: 404 }));
        assert_eq!(transport.calls("profile"), 2);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_and_wraps() {
        let (transport, dispatcher) = rig(quick_config());
        transport.set_default_outcome(Err(FetchError::Remote { status: 503 }));

        let err = dispatcher
            .enqueue("fleet/status", RequestOptions::get(), Priority::High)
            .wait()
            .await
            .unwrap_err();

        match err {
            FetchError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, FetchError::Remote { status: 503 }));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(transport.calls("fleet/status"), 4);
    }

    #[tokio::test]
    async fn per_task_timeout_override_applies() {
        let (transport, dispatcher) = rig(quick_config());
        transport.set_latency(Duration::from_millis(100));

        let err = dispatcher
            .enqueue_with(
                "slow",
                RequestOptions::get(),
                Priority::High,
                DispatchOptions {
                    policy: Some(RetryPolicy {
                        max_retries: 0,
                        ..RetryPolicy::test()
                    }),
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .wait()
            .await
            .unwrap_err();

        // A retryable timeout under a zero-retry policy exhausts after the
        // single attempt, same as the bare retry primitive.
        match err {
            FetchError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, FetchError::Timeout(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(transport.calls("slow"), 1);
    }

    #[tokio::test]
    async fn cancel_removes_only_the_first_waiting_match() {
        let (_transport, dispatcher) = rig(quick_config());

        dispatcher.pause();
        let first = dispatcher.enqueue("dup", RequestOptions::get(), Priority::Medium);
        let second = dispatcher.enqueue("dup", RequestOptions::get(), Priority::Medium);

        assert!(dispatcher.cancel("dup"));
        assert!(matches!(first.wait().await, Err(FetchError::Cancelled)));
        assert_eq!(dispatcher.status().waiting, 1);

        dispatcher.resume();
        second.wait().await.unwrap();
        assert!(!dispatcher.cancel("dup"));
    }

    #[tokio::test]
    async fn cancel_by_priority_clears_the_band() {
        let (_transport, dispatcher) = rig(quick_config());

        dispatcher.pause();
        let bg1 = dispatcher.enqueue("bg1", RequestOptions::get(), Priority::Background);
        let bg2 = dispatcher.enqueue("bg2", RequestOptions::get(), Priority::Background);
        let high = dispatcher.enqueue("high", RequestOptions::get(), Priority::High);

        assert_eq!(dispatcher.cancel_by_priority(Priority::Background), 2);
        assert!(matches!(bg1.wait().await, Err(FetchError::Cancelled)));
        assert!(matches!(bg2.wait().await, Err(FetchError::Cancelled)));
        assert_eq!(dispatcher.status().waiting, 1);

        dispatcher.resume();
        high.wait().await.unwrap();
    }

    #[tokio::test]
    async fn pause_holds_work_and_resume_releases_it() {
        let (transport, dispatcher) = rig(quick_config());

        dispatcher.pause();
        let handle = dispatcher.enqueue("held", RequestOptions::get(), Priority::High);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.total_calls(), 0);
        assert!(dispatcher.status().paused);

        dispatcher.resume();
        handle.wait().await.unwrap();
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test]
    async fn concurrency_adapts_to_link_quality() {
        let (_transport, dispatcher) = rig(quick_config());

        assert_eq!(dispatcher.adjust_concurrency(QualityClass::TwoG), 2);
        assert_eq!(dispatcher.status().max_concurrent, 2);
        assert_eq!(dispatcher.adjust_concurrency(QualityClass::Slow2g), 2);
        assert_eq!(dispatcher.adjust_concurrency(QualityClass::ThreeG), 3);
        assert_eq!(dispatcher.adjust_concurrency(QualityClass::FourG), 4);
        assert_eq!(dispatcher.adjust_concurrency(QualityClass::Unknown), 4);
        assert_eq!(dispatcher.status().max_concurrent, 4);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_waiting() {
        let (transport, dispatcher) = rig(quick_config());

        dispatcher.pause();
        let a = dispatcher.enqueue("a", RequestOptions::get(), Priority::High);
        let b = dispatcher.enqueue("b", RequestOptions::get(), Priority::Low);

        assert_eq!(dispatcher.shutdown(), 2);
        assert!(matches!(a.wait().await, Err(FetchError::Cancelled)));
        assert!(matches!(b.wait().await, Err(FetchError::Cancelled)));
        assert_eq!(transport.total_calls(), 0);
        assert!(dispatcher.status().paused);
    }
}
