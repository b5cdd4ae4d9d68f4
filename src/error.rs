//! Error taxonomy for transport-facing operations.
//!
//! Every failure a caller can observe through a completion handle or a
//! `fetch_*` call is one of these variants. Retryability is a property of the
//! error itself (`FetchError::is_retryable`), so the backoff primitive and
//! the dispatcher share a single classification.

use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryError;

/// HTTP statuses the default classifier treats as transient.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Failure modes for requests flowing through the engine.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The connection monitor reports offline; no transport attempt was made.
    #[error("no connection available")]
    NoConnection,

    /// The transport call exceeded its deadline and was cancelled.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure with no response (DNS, reset, broken pipe).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote answered with a non-success status.
    #[error("remote responded with status {status}")]
    Remote { status: u16 },

    /// The dispatcher waiting list was full and the request was not admitted.
    #[error("request queue is full")]
    QueueOverflow,

    /// The request was cancelled before it started.
    #[error("request cancelled")]
    Cancelled,

    /// All retry attempts were spent; wraps the final underlying error.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Default retryability classification.
    ///
    /// Transient transport conditions (timeout, no response) and the
    /// conventional transient HTTP statuses are retryable. Being offline is
    /// not: retrying while offline is wasted work, the durable queue covers
    /// that case instead.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Transport(_) => true,
            FetchError::Remote { status } => RETRYABLE_STATUSES.contains(status),
            FetchError::NoConnection
            | FetchError::QueueOverflow
            | FetchError::Cancelled
            | FetchError::RetryExhausted { .. } => false,
        }
    }

    /// Low-cardinality label for metrics.
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            FetchError::NoConnection => "no_connection",
            FetchError::Timeout(_) => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::Remote { .. } => "remote",
            FetchError::QueueOverflow => "overflow",
            FetchError::Cancelled => "cancelled",
            FetchError::RetryExhausted { .. } => "exhausted",
        }
    }

    /// Status code, when the failure carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Remote { status } => Some(*status),
            FetchError::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<RetryError<FetchError>> for FetchError {
    fn from(err: RetryError<FetchError>) -> Self {
        match err {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => FetchError::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
        }
    }
}
