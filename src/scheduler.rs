// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adaptive sync scheduler.
//!
//! Re-arms a single one-shot timer after every pass instead of ticking at a
//! fixed rate. The interval adapts to link quality, backlog size, app
//! visibility and battery saver, within `[min_interval, max_interval]`. A
//! backlog at or over `urgent_threshold` bypasses the interval entirely
//! (the debounce still enforces `min_interval` between pass starts).
//! Connectivity regained or a strictly better link class also syncs
//! immediately.
//!
//! The timer slot holds only timer tasks, never a running pass, so
//! [`SyncScheduler::stop`] can kill the timer without aborting a sync that
//! is already under way. Arms are epoch-stamped and a superseded timer
//! never fires, whatever order the arms landed in.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::{ConnectionMonitor, QualityClass};
use crate::metrics;
use crate::sync::SyncManager;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Floor between pass starts; also the debounce window.
    pub min_interval: Duration,
    /// Ceiling for the adaptive interval.
    pub max_interval: Duration,
    /// Backlog size at which the next sync happens immediately.
    pub urgent_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(300),
            urgent_threshold: 10,
        }
    }
}

/// Picks the next sync interval for the given conditions.
///
/// Slower links sync less often (there is less bandwidth to spend on
/// overhead), a growing backlog tightens the cadence, and an invisible app
/// or battery saver stretches it.
#[must_use]
pub fn compute_interval(
    quality: QualityClass,
    pending: u64,
    visible: bool,
    battery_saver: bool,
    config: &SchedulerConfig,
) -> Duration {
    let mut interval = match quality {
        QualityClass::Slow2g => config.max_interval,
        QualityClass::TwoG => config.max_interval.mul_f64(0.7),
        QualityClass::ThreeG => config.min_interval.saturating_mul(3),
        QualityClass::FourG => config.min_interval,
        QualityClass::Unknown => config.min_interval.saturating_mul(2),
    };

    if pending > config.urgent_threshold / 2 {
        interval /= 2;
    }
    if battery_saver {
        interval = interval.mul_f64(1.5);
    }
    if !visible {
        interval = interval.saturating_mul(2);
    }

    interval.max(config.min_interval).min(config.max_interval)
}

/// Scheduler state visible to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub timer_armed: bool,
    /// Last computed interval; zero right after an urgent (immediate) arm.
    pub current_interval: Duration,
    pub visible: bool,
    pub battery_saver: bool,
}

struct SchedulerInner {
    manager: Arc<SyncManager>,
    monitor: ConnectionMonitor,
    config: SchedulerConfig,
    running: AtomicBool,
    visible: AtomicBool,
    battery_saver: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_epoch: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    last_sync_start: Mutex<Option<Instant>>,
    current_interval: Mutex<Duration>,
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    pub fn new(
        manager: Arc<SyncManager>,
        monitor: ConnectionMonitor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                monitor,
                config,
                running: AtomicBool::new(false),
                visible: AtomicBool::new(true),
                battery_saver: AtomicBool::new(false),
                timer: Mutex::new(None),
                timer_epoch: AtomicU64::new(0),
                listener: Mutex::new(None),
                last_sync_start: Mutex::new(None),
                current_interval: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Starts the cadence. Idempotent; a second call is a no-op.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("sync scheduler started");
        spawn_quality_listener(&self.inner);
        schedule_next(&self.inner).await;
    }

    /// Stops the cadence. The armed timer and the quality listener are
    /// killed; a sync pass already under way runs to completion.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Invalidate any timer still mid-arm, then kill the armed one.
        self.inner.timer_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        info!("sync scheduler stopped");
    }

    /// Runs a sync pass now (debounce permitting) and re-arms the timer.
    /// No-op while stopped; deferred while offline.
    pub async fn trigger_sync(&self) {
        trigger(&self.inner).await;
    }

    /// Caller-facing name for [`trigger_sync`](Self::trigger_sync). Same
    /// debounce and offline rules apply.
    pub async fn sync_now(&self) {
        self.trigger_sync().await;
    }

    /// Host app visibility. Hidden apps sync at half the cadence.
    pub fn set_visible(&self, visible: bool) {
        if self.inner.visible.swap(visible, Ordering::SeqCst) != visible {
            debug!(visible, "visibility changed");
            self.reschedule();
        }
    }

    /// Battery saver stretches the cadence by half.
    pub fn set_battery_saver(&self, enabled: bool) {
        if self.inner.battery_saver.swap(enabled, Ordering::SeqCst) != enabled {
            debug!(enabled, "battery saver changed");
            self.reschedule();
        }
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            timer_armed: self.inner.timer.lock().as_ref().is_some_and(|t| !t.is_finished()),
            current_interval: *self.inner.current_interval.lock(),
            visible: self.inner.visible.load(Ordering::SeqCst),
            battery_saver: self.inner.battery_saver.load(Ordering::SeqCst),
        }
    }

    fn reschedule(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            schedule_next(&inner).await;
        });
    }
}

/// Arms (or re-arms) the one-shot timer. Every arm takes a fresh epoch and
/// a timer refuses to fire once its epoch is stale, so a zero-delay timer
/// racing its own registration cannot orphan a live predecessor, and an arm
/// landing after [`SyncScheduler::stop`] cannot leave a timer behind.
fn arm_timer(inner: &Arc<SchedulerInner>, delay: Duration) {
    let epoch = inner.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let timer_inner = inner.clone();
    let handle = tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // A newer arm or stop() may have superseded this timer while it
        // slept, or before its handle was even stored.
        if timer_inner.timer_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        // The pass runs in its own task, never through the timer slot, so
        // stop() can abort the timer without touching a sync under way.
        let trigger_inner = timer_inner.clone();
        tokio::spawn(async move {
            trigger(&trigger_inner).await;
        });
    });

    let mut slot = inner.timer.lock();
    if inner.timer_epoch.load(Ordering::SeqCst) != epoch || !inner.running.load(Ordering::SeqCst) {
        handle.abort();
        return;
    }
    if let Some(old) = slot.replace(handle) {
        old.abort();
    }
}

async fn trigger(inner: &Arc<SchedulerInner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }

    if !inner.monitor.is_online() {
        debug!("offline, deferring scheduled sync");
        schedule_next(inner).await;
        return;
    }

    // Debounce: re-arm for the remainder instead of rescheduling, so an
    // urgent backlog cannot spin the zero-delay path.
    let wait = {
        let last = inner.last_sync_start.lock();
        last.and_then(|started| inner.config.min_interval.checked_sub(started.elapsed()))
    };
    if let Some(wait) = wait {
        if !wait.is_zero() {
            debug!(
                wait_ms = wait.as_millis() as u64,
                "sync requested inside the debounce window, deferring"
            );
            arm_timer(inner, wait);
            return;
        }
    }
    *inner.last_sync_start.lock() = Some(Instant::now());

    let report = inner.manager.sync_all().await;
    if report.skipped {
        debug!("scheduled sync pass was skipped");
    }
    schedule_next(inner).await;
}

async fn schedule_next(inner: &Arc<SchedulerInner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }

    let pending = inner.manager.pending_count().await;
    if pending >= inner.config.urgent_threshold && inner.monitor.is_online() {
        debug!(pending, "backlog over urgent threshold, syncing immediately");
        *inner.current_interval.lock() = Duration::ZERO;
        arm_timer(inner, Duration::ZERO);
        return;
    }

    let state = inner.monitor.state();
    let interval = compute_interval(
        state.quality,
        pending,
        inner.visible.load(Ordering::SeqCst),
        inner.battery_saver.load(Ordering::SeqCst),
        &inner.config,
    );
    *inner.current_interval.lock() = interval;
    metrics::set_sync_interval(interval);
    debug!(
        interval_secs = interval.as_secs(),
        pending,
        quality = state.quality.as_str(),
        "next sync scheduled"
    );
    arm_timer(inner, interval);
}

/// Watches connection state; regained connectivity or a strictly better
/// link class syncs immediately, any other change recomputes the cadence.
fn spawn_quality_listener(inner: &Arc<SchedulerInner>) {
    let mut rx = inner.monitor.subscribe();
    let listener_inner = inner.clone();
    let handle = tokio::spawn(async move {
        let mut previous = rx.borrow().clone();
        while rx.changed().await.is_ok() {
            let current = rx.borrow().clone();
            let came_online = current.is_online && !previous.is_online;
            let improved =
                current.is_online && current.quality.is_improvement_over(previous.quality);

            if came_online || improved {
                info!(
                    came_online,
                    quality = current.quality.as_str(),
                    "connectivity improved, syncing now"
                );
                // Detached so stopping the scheduler never aborts the pass
                let trigger_inner = listener_inner.clone();
                tokio::spawn(async move {
                    trigger(&trigger_inner).await;
                });
            } else if current.is_online != previous.is_online
                || current.quality != previous.quality
            {
                let reschedule_inner = listener_inner.clone();
                tokio::spawn(async move {
                    schedule_next(&reschedule_inner).await;
                });
            }
            previous = current;
        }
    });
    if let Some(old) = inner.listener.lock().replace(handle) {
        old.abort();
    }
}
