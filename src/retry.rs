// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Provides configurable retry behavior for transient failures. The caller
//! supplies a classifier deciding which errors are worth retrying; anything
//! else propagates immediately.
//!
//! # Example
//!
//! ```
//! use offline_engine::RetryPolicy;
//! use std::time::Duration;
//!
//! // Default: 3 retries, 1s initial delay, doubling up to 30s
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.max_retries, 3);
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(1), Duration::from_secs(2));
//!
//! // Quick: fewer, faster attempts for interactive paths
//! let quick = RetryPolicy::quick();
//! assert_eq!(quick.max_retries, 2);
//! ```

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

/// Fraction of the computed delay added as uniform random jitter, so that
/// clients recovering from the same outage do not retry in lockstep.
pub const JITTER_FRACTION: f64 = 0.3;

/// Backoff policy for a retried operation.
///
/// Use the preset constructors for common patterns:
/// - [`RetryPolicy::default()`] - general transport calls
/// - [`RetryPolicy::quick()`] - interactive paths that should fail fast
/// - [`RetryPolicy::patient()`] - background work that can afford to wait
/// - [`RetryPolicy::storage()`] - local storage queries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means exactly one attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fail fast for interactive requests a user is waiting on.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Patient backoff for background transfers over a poor link.
    #[must_use]
    pub fn patient() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// Short retry for local storage operations (busy database, not outages).
    #[must_use]
    pub fn storage() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Pre-jitter delay before retry number `attempt` (0-based):
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let raw = (self.initial_delay.as_secs_f64() * factor).max(0.0);
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// [`Self::delay_for`] plus uniform jitter in `[0, 0.3 * delay]`.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.delay_for(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        base + base.mul_f64(jitter)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    /// The classifier rejected the error; no further attempts were made.
    #[error("non-retryable failure: {0}")]
    Fatal(E),

    /// Every attempt failed; carries the final error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The underlying error, regardless of how the retry loop ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `operation` up to `policy.max_retries + 1` times.
///
/// Errors for which `is_retryable` returns false propagate immediately as
/// [`RetryError::Fatal`]. Between attempts the caller is suspended for the
/// policy's jittered backoff delay; the suspension is a plain `sleep`, so
/// dropping the returned future cancels the whole loop cleanly.
pub async fn retry<F, Fut, T, E, C>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_retryable: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 0 {
                    info!(
                        "Operation '{}' succeeded after {} retries",
                        operation_name, attempt
                    );
                }
                return Ok(val);
            }
            Err(err) if !is_retryable(&err) => {
                warn!(
                    "Operation '{}' failed with non-retryable error: {}",
                    operation_name, err
                );
                return Err(RetryError::Fatal(err));
            }
            Err(err) => {
                attempt += 1;
                crate::metrics::record_retry_attempt(operation_name);

                if attempt > policy.max_retries {
                    warn!(
                        "Operation '{}' exhausted {} attempts: {}",
                        operation_name, attempt, err
                    );
                    crate::metrics::record_retry_exhausted(operation_name);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                let delay = policy.delay_with_jitter(attempt - 1);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt,
                    policy.max_retries + 1,
                    err,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}
