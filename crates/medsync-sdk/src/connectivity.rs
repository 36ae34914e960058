//! OS-level connectivity signal.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Online/offline transition reported by the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Source of host connectivity: a synchronous flag plus transition events.
pub trait ConnectivitySource: Send + Sync + 'static {
    /// Whether the host currently believes it has network access.
    fn is_online(&self) -> bool;

    /// Subscribe to online/offline transitions.
    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent>;
}

/// Connectivity source driven by explicit calls.
///
/// Used by tests and simulations, and by embedders that receive connectivity
/// callbacks from their platform.
pub struct ManualConnectivity {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            online: AtomicBool::new(online),
            events,
        }
    }

    /// Set the flag, emitting an event only on an actual change.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            let event = if online {
                ConnectivityEvent::Online
            } else {
                ConnectivityEvent::Offline
            };
            let _ = self.events.send(event);
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}
