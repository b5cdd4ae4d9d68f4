//! Task model for the priority dispatcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::transport::{RequestOptions, Response};

/// Scheduling band for dispatched requests. `Critical` runs first;
/// `Background` tasks are the first evicted when the queue overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    /// Index into per-priority arrays; lower runs sooner.
    #[must_use]
    pub fn band(&self) -> usize {
        *self as usize
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

/// Lifecycle of a dispatched task.
///
/// ```text
/// pending -> running -> succeeded
///               |   \-> failed
///               \--> retry-scheduled -> pending (re-queued)
/// ```
/// `pending -> failed` also occurs for cancellation and overflow eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    #[must_use]
    pub fn can_transition(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, RetryScheduled)
                | (RetryScheduled, Pending)
        )
    }
}

/// A request waiting in (or running from) the dispatcher.
pub(crate) struct QueuedTask {
    pub id: u64,
    pub target: String,
    pub options: RequestOptions,
    pub priority: Priority,
    pub policy: RetryPolicy,
    pub timeout: Option<Duration>,
    /// Retries already consumed by this task.
    pub retries: u32,
    pub enqueued_at: Instant,
    pub state: TaskState,
    done: Option<oneshot::Sender<Result<Response, FetchError>>>,
}

impl QueuedTask {
    pub fn new(
        id: u64,
        target: impl Into<String>,
        options: RequestOptions,
        priority: Priority,
        policy: RetryPolicy,
        timeout: Option<Duration>,
        done: oneshot::Sender<Result<Response, FetchError>>,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            options,
            priority,
            policy,
            timeout,
            retries: 0,
            enqueued_at: Instant::now(),
            state: TaskState::Pending,
            done: Some(done),
        }
    }

    pub fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal task transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }

    /// Delivers the final result to the waiting handle. A dropped handle is
    /// fine; the send result is intentionally ignored.
    pub fn resolve(&mut self, result: Result<Response, FetchError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// Handle returned by `enqueue`; await [`DispatchHandle::wait`] for the
/// task's final outcome.
#[derive(Debug)]
pub struct DispatchHandle {
    pub id: u64,
    pub(crate) rx: oneshot::Receiver<Result<Response, FetchError>>,
}

impl DispatchHandle {
    /// Waits for the task to finish. A task torn down without a verdict
    /// (dispatcher shutdown) reports [`FetchError::Cancelled`].
    pub async fn wait(self) -> Result<Response, FetchError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Cancelled),
        }
    }
}

/// Per-task overrides for `enqueue_with`.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Retry policy override; `None` uses the dispatcher's policy.
    pub policy: Option<RetryPolicy>,
    /// Deadline override; `None` uses the dispatcher's default timeout.
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_order_critical_first() {
        assert_eq!(Priority::Critical.band(), 0);
        assert_eq!(Priority::Background.band(), 4);
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Background);
        for (band, priority) in Priority::ALL.iter().enumerate() {
            assert_eq!(priority.band(), band);
        }
    }

    #[test]
    fn transition_table() {
        use TaskState::*;
        let legal = [
            (Pending, Running),
            (Pending, Failed),
            (Running, Succeeded),
            (Running, Failed),
            (Running, RetryScheduled),
            (RetryScheduled, Pending),
        ];
        let all = [Pending, Running, RetryScheduled, Succeeded, Failed];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{from:?} -> {to:?} should be {}",
                    if expected { "legal" } else { "illegal" }
                );
            }
        }
        assert!(Succeeded.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!RetryScheduled.is_terminal());
    }

    #[tokio::test]
    async fn dropped_sender_reports_cancellation() {
        let (tx, rx) = oneshot::channel();
        let handle = DispatchHandle { id: 1, rx };
        drop(tx);
        assert!(matches!(handle.wait().await, Err(FetchError::Cancelled)));
    }

    #[test]
    fn priorities_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&Priority::Background).unwrap(),
            "\"background\""
        );
        let parsed: Priority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, Priority::Critical);
    }
}
