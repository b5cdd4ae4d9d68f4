// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection quality monitoring and connection-aware fetching.
//!
//! A single listener task is the only writer of [`ConnectionState`]; readers
//! observe it through a `tokio::sync::watch` channel, so reads are wait-free
//! and every subscriber sees changes in order. On top of the state the
//! monitor offers [`ConnectionMonitor::fetch`] (offline gate + adaptive
//! timeout, one attempt) and [`ConnectionMonitor::fetch_with_retry`]
//! (the same wrapped in exponential backoff).

pub mod signals;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::retry::{retry, RetryPolicy};
use crate::transport::{RequestOptions, Response, Transport};

pub use signals::{LinkHints, ManualSignals, PlatformSignals, SignalEvent};

/// Coarse network-speed bucket used to derive timeouts and sync cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum QualityClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "unknown")]
    Unknown,
}

impl QualityClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityClass::Slow2g => "slow-2g",
            QualityClass::TwoG => "2g",
            QualityClass::ThreeG => "3g",
            QualityClass::FourG => "4g",
            QualityClass::Unknown => "unknown",
        }
    }

    /// Speed rank for comparisons; `Unknown` has no rank.
    #[must_use]
    pub fn rank(&self) -> Option<u8> {
        match self {
            QualityClass::Slow2g => Some(0),
            QualityClass::TwoG => Some(1),
            QualityClass::ThreeG => Some(2),
            QualityClass::FourG => Some(3),
            QualityClass::Unknown => None,
        }
    }

    /// True when moving from `previous` to `self` is a strictly better link.
    /// Learning any concrete class after `Unknown` counts as an improvement;
    /// losing the class never does.
    #[must_use]
    pub fn is_improvement_over(self, previous: QualityClass) -> bool {
        match (previous.rank(), self.rank()) {
            (Some(prev), Some(current)) => current > prev,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Snapshot of the link as last reported by the platform.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub is_online: bool,
    pub quality: QualityClass,
    /// Reported downlink bandwidth; `0.0` means unreported.
    pub downlink_mbps: f64,
    /// Reported round-trip estimate; `0.0` means unreported.
    pub rtt_ms: f64,
    pub data_saver: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_online: true,
            quality: QualityClass::Unknown,
            downlink_mbps: 0.0,
            rtt_ms: 0.0,
            data_saver: false,
        }
    }
}

impl ConnectionState {
    /// True for links where heavy transfers should be avoided.
    #[must_use]
    pub fn is_slow(&self) -> bool {
        matches!(self.quality, QualityClass::Slow2g | QualityClass::TwoG)
            || (self.downlink_mbps > 0.0 && self.downlink_mbps < 1.0)
    }

    /// Transport deadline appropriate for the current link quality.
    #[must_use]
    pub fn adaptive_timeout(&self) -> Duration {
        match self.quality {
            QualityClass::Slow2g => Duration::from_secs(30),
            QualityClass::TwoG => Duration::from_secs(20),
            QualityClass::ThreeG => Duration::from_secs(15),
            QualityClass::FourG | QualityClass::Unknown => Duration::from_secs(10),
        }
    }

    /// Applies one platform signal. A link change replaces the link fields
    /// wholesale; absent hints degrade to `Unknown`/defaults rather than
    /// carrying stale values forward.
    pub(crate) fn apply(&mut self, event: &SignalEvent) {
        match event {
            SignalEvent::Online => self.is_online = true,
            SignalEvent::Offline => self.is_online = false,
            SignalEvent::LinkChange(hints) => {
                self.quality = hints.quality.unwrap_or(QualityClass::Unknown);
                self.downlink_mbps = hints.downlink_mbps.unwrap_or(0.0);
                self.rtt_ms = hints.rtt_ms.unwrap_or(0.0);
                self.data_saver = hints.data_saver.unwrap_or(false);
            }
        }
    }
}

struct MonitorInner {
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

/// Cheap-to-clone handle to the connection state and the transport wrappers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    /// Subscribes to `signals` (exactly once) and spawns the listener task
    /// that owns all state mutation.
    pub fn new(transport: Arc<dyn Transport>, signals: &dyn PlatformSignals) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let inner = Arc::new(MonitorInner {
            transport,
            state_tx,
            listener: Mutex::new(None),
        });

        let mut events = signals.subscribe();
        let tx = inner.state_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let before = tx.borrow().clone();
                tx.send_modify(|state| state.apply(&event));
                let after = tx.borrow().clone();

                if before.is_online != after.is_online {
                    if after.is_online {
                        info!("connection restored");
                    } else {
                        warn!("connection lost");
                    }
                }
                if before.quality != after.quality {
                    info!(
                        from = before.quality.as_str(),
                        to = after.quality.as_str(),
                        downlink_mbps = after.downlink_mbps,
                        "link quality changed"
                    );
                }
                crate::metrics::set_connection(&after);
            }
            debug!("platform signal stream closed");
        });
        *inner.listener.lock() = Some(handle);

        Self { inner }
    }

    /// Current snapshot (non-blocking).
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch receiver observing every state change in order.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.state_tx.borrow().is_online
    }

    #[must_use]
    pub fn is_slow(&self) -> bool {
        self.inner.state_tx.borrow().is_slow()
    }

    #[must_use]
    pub fn adaptive_timeout(&self) -> Duration {
        self.inner.state_tx.borrow().adaptive_timeout()
    }

    /// One transport attempt behind the offline gate and the adaptive
    /// timeout. A non-success status surfaces as [`FetchError::Remote`].
    pub async fn fetch(
        &self,
        target: &str,
        options: &RequestOptions,
    ) -> Result<Response, FetchError> {
        self.fetch_with_timeout(target, options, None).await
    }

    /// [`Self::fetch`] with a caller-supplied deadline instead of the
    /// adaptive one. The transport future is dropped when the deadline
    /// fires, which cancels the call.
    pub async fn fetch_with_timeout(
        &self,
        target: &str,
        options: &RequestOptions,
        timeout_override: Option<Duration>,
    ) -> Result<Response, FetchError> {
        let state = self.state();
        if !state.is_online {
            crate::metrics::record_fetch("no_connection");
            return Err(FetchError::NoConnection);
        }

        let deadline = timeout_override.unwrap_or_else(|| state.adaptive_timeout());
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            deadline,
            self.inner.transport.send(target, options),
        )
        .await;

        let result = match outcome {
            Err(_) => Err(FetchError::Timeout(deadline)),
            Ok(Ok(response)) => response.error_for_status(),
            Ok(Err(err)) => Err(err),
        };
        crate::metrics::record_fetch_latency(started.elapsed());
        match &result {
            Ok(_) => crate::metrics::record_fetch("success"),
            Err(err) => {
                debug!(target, error = %err, "fetch failed");
                crate::metrics::record_fetch(err.metric_label());
            }
        }
        result
    }

    /// Retrying fetch. Fails immediately with [`FetchError::NoConnection`]
    /// while offline, without touching the transport; the durable queue
    /// exists for that case. `None` policy means [`RetryPolicy::default`].
    #[tracing::instrument(skip(self, options, policy), fields(target = %target))]
    pub async fn fetch_with_retry(
        &self,
        target: &str,
        options: &RequestOptions,
        policy: Option<&RetryPolicy>,
    ) -> Result<Response, FetchError> {
        if !self.is_online() {
            crate::metrics::record_fetch("no_connection");
            return Err(FetchError::NoConnection);
        }

        let default_policy;
        let policy = match policy {
            Some(p) => p,
            None => {
                default_policy = RetryPolicy::default();
                &default_policy
            }
        };

        retry("fetch", policy, FetchError::is_retryable, move || {
            self.fetch(target, options)
        })
        .await
        .map_err(FetchError::from)
    }
}
