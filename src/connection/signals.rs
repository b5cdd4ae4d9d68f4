//! Platform signal sources feeding the connection monitor.
//!
//! Hosts surface their online/offline and network-information events through
//! [`PlatformSignals`]; the engine subscribes exactly once at startup. The
//! in-crate [`ManualSignals`] binding lets embedders (and tests) push events
//! by hand.

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::QualityClass;

/// One event from the host platform.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Online,
    Offline,
    LinkChange(LinkHints),
}

/// Network-information hints accompanying a link change. All fields are
/// optional: platforms that cannot report them degrade to `Unknown` quality
/// without crashing.
#[derive(Debug, Clone, Default)]
pub struct LinkHints {
    pub quality: Option<QualityClass>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub data_saver: Option<bool>,
}

impl LinkHints {
    /// Hints carrying only a quality class.
    #[must_use]
    pub fn quality(quality: QualityClass) -> Self {
        Self { quality: Some(quality), ..Self::default() }
    }
}

/// Source of connectivity events the monitor subscribes to once at startup.
pub trait PlatformSignals: Send + Sync {
    /// Registers a subscriber. Events are delivered to every live receiver
    /// in emission order.
    fn subscribe(&self) -> UnboundedReceiver<SignalEvent>;
}

/// Manually driven signal source.
///
/// Production hosts call the emit methods from their platform callbacks;
/// tests call them directly to simulate connectivity changes.
#[derive(Default)]
pub struct ManualSignals {
    subscribers: Mutex<Vec<UnboundedSender<SignalEvent>>>,
}

impl ManualSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to all subscribers, pruning closed ones.
    pub fn emit(&self, event: SignalEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn online(&self) {
        self.emit(SignalEvent::Online);
    }

    pub fn offline(&self) {
        self.emit(SignalEvent::Offline);
    }

    pub fn link_change(&self, hints: LinkHints) {
        self.emit(SignalEvent::LinkChange(hints));
    }
}

impl PlatformSignals for ManualSignals {
    fn subscribe(&self) -> UnboundedReceiver<SignalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
