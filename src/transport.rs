//! Transport seam between the engine and the host's network stack.
//!
//! The engine never performs wire I/O itself; hosts implement [`Transport`]
//! over whatever HTTP client (or other protocol) they use. Cancellation is
//! by drop: when a timeout fires, the in-flight `send` future is dropped and
//! the implementation must abandon the call.
//!
//! [`MockTransport`] is the in-crate implementation used by tests and demos:
//! outcomes are scripted per target, and it records calls so tests can assert
//! on attempt counts and ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;

use crate::error::FetchError;

/// Options for a single transport call. Opaque to the engine beyond the verb.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: String,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { method: "GET".into(), body: None }
    }
}

impl RequestOptions {
    pub fn new(method: impl Into<String>, body: Option<Value>) -> Self {
        Self { method: method.into(), body }
    }

    #[must_use]
    pub fn get() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn post(body: Value) -> Self {
        Self { method: "POST".into(), body: Some(body) }
    }
}

/// A transport-level response. A non-success status is still a response;
/// [`Response::error_for_status`] converts it into the error taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// A plain `200 OK` with the given body.
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Response, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::Remote { status: self.status })
        }
    }
}

/// Host-provided request executor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes one request. Implementations must be cancel-safe: the engine
    /// drops this future to enforce timeouts.
    async fn send(&self, target: &str, options: &RequestOptions) -> Result<Response, FetchError>;
}

/// One recorded call against a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub target: String,
    pub method: String,
    pub body: Option<Value>,
}

/// Scriptable transport for tests and demos.
///
/// Each target has a queue of scripted outcomes consumed in order; once the
/// queue is empty the default outcome (initially `200 OK`) is returned.
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<Response, FetchError>>>>,
    default_outcome: Mutex<Result<Response, FetchError>>,
    latency: Mutex<Option<Duration>>,
    counts: DashMap<String, u64>,
    log: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(Ok(Response::ok(Value::Null))),
            latency: Mutex::new(None),
            counts: DashMap::new(),
            log: Mutex::new(Vec::new()),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
        }
    }

    /// Appends scripted outcomes for `target`, consumed one per call.
    pub fn script(&self, target: &str, outcomes: Vec<Result<Response, FetchError>>) {
        self.scripts
            .lock()
            .entry(target.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Shorthand: the next `times` calls to `target` fail with `err`.
    pub fn fail_times(&self, target: &str, err: FetchError, times: usize) {
        self.script(target, std::iter::repeat(err).map(Err).take(times).collect());
    }

    /// Outcome returned when no script is queued for a target.
    pub fn set_default_outcome(&self, outcome: Result<Response, FetchError>) {
        *self.default_outcome.lock() = outcome;
    }

    /// Adds artificial latency to every call, keeping requests in flight long
    /// enough for concurrency assertions.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    #[must_use]
    pub fn calls(&self, target: &str) -> u64 {
        self.counts.get(target).map(|c| *c).unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.counts.iter().map(|c| *c.value()).sum()
    }

    /// Targets in the order they were called.
    #[must_use]
    pub fn call_order(&self) -> Vec<String> {
        self.log.lock().iter().map(|c| c.target.clone()).collect()
    }

    #[must_use]
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.log.lock().clone()
    }

    /// Highest number of concurrently in-flight calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

// Restores the in-flight gauge even when a send future is dropped mid-call.
struct FlightGuard<'a>(&'a AtomicU64);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, target: &str, options: &RequestOptions) -> Result<Response, FetchError> {
        *self.counts.entry(target.to_string()).or_insert(0) += 1;
        self.log.lock().push(RecordedCall {
            target: target.to_string(),
            method: options.method.clone(),
            body: options.body.clone(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _flight = FlightGuard(&self.in_flight);

        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(target)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => self.default_outcome.lock().clone(),
        }
    }
}
