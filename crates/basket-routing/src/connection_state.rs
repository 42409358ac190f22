//! Connection-state tracking.
//!
//! Registry of backend connections in registration order, with each
//! connection's state, its heartbeat setting and the pipeline currently
//! wrapping it. Also derives the basket-level connect/disconnect events
//! the caller sees.

use basket_adapter::MessageAdapter;
use basket_core::{AdapterId, ReplyError};
use basket_telemetry::Metrics;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// State of one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Messages may be handed to (or buffered for) the connection.
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basket-level connection event for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasketEvent {
    Connected,
    ConnectFailed(Vec<ReplyError>),
    Disconnected,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: AdapterId,
    pub name: String,
    pub state: ConnectionState,
    pub heartbeat: bool,
    pub last_error: Option<ReplyError>,
}

struct TrackedConnection {
    backend: Arc<dyn MessageAdapter>,
    /// Pipeline wrapping the backend since the last connect.
    active: Option<Arc<dyn MessageAdapter>>,
    state: ConnectionState,
    heartbeat: Option<bool>,
    last_error: Option<ReplyError>,
}

#[derive(Default)]
struct BasketFlags {
    connect_requested: bool,
    connect_reported: bool,
    disconnect_reported: bool,
}

/// Tracks every registered backend connection.
pub struct ConnectionStateTracker {
    entries: RwLock<Vec<TrackedConnection>>,
    basket: RwLock<BasketFlags>,
    heartbeat_default: bool,
}

impl ConnectionStateTracker {
    pub fn new(heartbeat_default: bool) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            basket: RwLock::new(BasketFlags::default()),
            heartbeat_default,
        }
    }

    /// Register a backend. Returns `false` if it is already registered.
    pub fn register(&self, backend: Arc<dyn MessageAdapter>) -> bool {
        let mut entries = self.entries.write();
        let id = backend.id();
        if entries.iter().any(|e| e.backend.id() == id) {
            return false;
        }
        info!(adapter = %backend.name(), %id, "Registered backend");
        Metrics::adapter_state_set(backend.name(), ConnectionState::Disconnected.as_str());
        entries.push(TrackedConnection {
            backend,
            active: None,
            state: ConnectionState::Disconnected,
            heartbeat: None,
            last_error: None,
        });
        true
    }

    pub fn unregister(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|e| e.backend.id() == id)?;
        let removed = entries.remove(index);
        info!(adapter = %removed.backend.name(), %id, "Unregistered backend");
        Some(removed.backend)
    }

    /// Set a connection's state, returning the previous one.
    pub fn set_state(&self, id: AdapterId, state: ConnectionState) -> Option<ConnectionState> {
        let mut entries = self.entries.write();
        let entry = entries.iter_mut().find(|e| e.backend.id() == id)?;
        let previous = entry.state;
        entry.state = state;
        if state == ConnectionState::Connected {
            entry.last_error = None;
        }
        debug!(adapter = %entry.backend.name(), from = %previous, to = %state, "Connection state");
        Metrics::adapter_state_set(entry.backend.name(), state.as_str());
        Some(previous)
    }

    pub fn set_error(&self, id: AdapterId, error: ReplyError) {
        if let Some(entry) = self.entries.write().iter_mut().find(|e| e.backend.id() == id) {
            entry.last_error = Some(error);
        }
    }

    pub fn state(&self, id: AdapterId) -> Option<ConnectionState> {
        self.entries
            .read()
            .iter()
            .find(|e| e.backend.id() == id)
            .map(|e| e.state)
    }

    /// Install the pipeline wrapping a backend.
    pub fn set_active(&self, id: AdapterId, adapter: Arc<dyn MessageAdapter>) {
        if let Some(entry) = self.entries.write().iter_mut().find(|e| e.backend.id() == id) {
            entry.active = Some(adapter);
        }
    }

    /// Adapter messages are sent to: the pipeline if wrapped, else the backend.
    pub fn adapter(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.backend.id() == id)
            .map(|e| e.active.clone().unwrap_or_else(|| e.backend.clone()))
    }

    pub fn backend(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.backend.id() == id)
            .map(|e| e.backend.clone())
    }

    /// Registered backends, in registration order.
    pub fn backends(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.entries.read().iter().map(|e| e.backend.clone()).collect()
    }

    /// Connected adapters, in registration order.
    pub fn connected(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.state == ConnectionState::Connected)
            .map(|e| e.active.clone().unwrap_or_else(|| e.backend.clone()))
            .collect()
    }

    /// Connected or connecting adapters, in registration order.
    pub fn routable_adapters(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.state.is_routable())
            .map(|e| e.active.clone().unwrap_or_else(|| e.backend.clone()))
            .collect()
    }

    /// Adapter if it is connected or still connecting.
    pub fn routable(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.backend.id() == id && e.state.is_routable())
            .map(|e| e.active.clone().unwrap_or_else(|| e.backend.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn has_connecting(&self) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.state == ConnectionState::Connecting)
    }

    pub fn any_connected(&self) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.state == ConnectionState::Connected)
    }

    pub fn all_down(&self) -> bool {
        self.entries.read().iter().all(|e| e.state.is_down())
    }

    /// Explicit heartbeat setting for a backend.
    pub fn set_heartbeat(&self, id: AdapterId, enabled: bool) -> bool {
        match self.entries.write().iter_mut().find(|e| e.backend.id() == id) {
            Some(entry) => {
                entry.heartbeat = Some(enabled);
                true
            }
            None => false,
        }
    }

    /// Effective heartbeat setting for a backend.
    pub fn heartbeat(&self, id: AdapterId) -> bool {
        self.entries
            .read()
            .iter()
            .find(|e| e.backend.id() == id)
            .and_then(|e| e.heartbeat)
            .unwrap_or(self.heartbeat_default)
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.entries
            .read()
            .iter()
            .map(|e| ConnectionSnapshot {
                id: e.backend.id(),
                name: e.backend.name().to_string(),
                state: e.state,
                heartbeat: e.heartbeat.unwrap_or(self.heartbeat_default),
                last_error: e.last_error.clone(),
            })
            .collect()
    }

    /// Every state back to disconnected; pipelines dropped.
    pub fn reset(&self) {
        for entry in self.entries.write().iter_mut() {
            entry.state = ConnectionState::Disconnected;
            entry.active = None;
            Metrics::adapter_state_set(entry.backend.name(), entry.state.as_str());
        }
        *self.basket.write() = BasketFlags::default();
    }

    /// Start of a basket-level connect.
    pub fn begin_connect(&self) {
        *self.basket.write() = BasketFlags {
            connect_requested: true,
            ..Default::default()
        };
    }

    /// Start of a basket-level disconnect.
    pub fn begin_disconnect(&self) {
        let mut basket = self.basket.write();
        basket.connect_requested = false;
        basket.disconnect_reported = false;
    }

    /// Caller asked to connect and has not disconnected since.
    pub fn connect_requested(&self) -> bool {
        self.basket.read().connect_requested
    }

    /// Event to report after a backend connected.
    pub fn after_connected(&self, on_first_adapter: bool) -> Option<BasketEvent> {
        let mut basket = self.basket.write();
        if basket.connect_reported {
            return None;
        }
        if on_first_adapter || !self.has_connecting() {
            basket.connect_reported = true;
            basket.disconnect_reported = false;
            return Some(BasketEvent::Connected);
        }
        None
    }

    /// Event to report once no backend is still connecting.
    pub fn after_connect_answered(&self) -> Option<BasketEvent> {
        let mut basket = self.basket.write();
        if basket.connect_reported || self.has_connecting() {
            return None;
        }
        basket.connect_reported = true;
        if self.any_connected() {
            return Some(BasketEvent::Connected);
        }
        let errors = self
            .entries
            .read()
            .iter()
            .filter_map(|e| e.last_error.clone())
            .collect();
        Some(BasketEvent::ConnectFailed(errors))
    }

    /// Event to report after a backend disconnected.
    pub fn after_disconnected(&self) -> Option<BasketEvent> {
        let mut basket = self.basket.write();
        if basket.disconnect_reported || !self.all_down() {
            return None;
        }
        basket.disconnect_reported = true;
        basket.connect_reported = false;
        Some(BasketEvent::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_adapter::SimAdapter;
    use basket_core::Capabilities;

    fn sim(name: &str) -> Arc<dyn MessageAdapter> {
        Arc::new(SimAdapter::new(name, Capabilities::new()))
    }

    #[test]
    fn test_register_preserves_order_and_rejects_duplicates() {
        let tracker = ConnectionStateTracker::new(true);
        let a = sim("a");
        let b = sim("b");
        assert!(tracker.register(a.clone()));
        assert!(tracker.register(b.clone()));
        assert!(!tracker.register(a.clone()));

        tracker.set_state(a.id(), ConnectionState::Connected);
        tracker.set_state(b.id(), ConnectionState::Connected);
        let names: Vec<_> = tracker
            .connected()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_routable_includes_connecting() {
        let tracker = ConnectionStateTracker::new(true);
        let a = sim("a");
        tracker.register(a.clone());
        assert!(tracker.routable(a.id()).is_none());
        tracker.set_state(a.id(), ConnectionState::Connecting);
        assert!(tracker.routable(a.id()).is_some());
        assert!(tracker.connected().is_empty());
    }

    #[test]
    fn test_connect_event_on_first_adapter() {
        let tracker = ConnectionStateTracker::new(true);
        let (a, b) = (sim("a"), sim("b"));
        tracker.register(a.clone());
        tracker.register(b.clone());
        tracker.begin_connect();
        tracker.set_state(a.id(), ConnectionState::Connecting);
        tracker.set_state(b.id(), ConnectionState::Connecting);

        tracker.set_state(a.id(), ConnectionState::Connected);
        assert_eq!(tracker.after_connected(true), Some(BasketEvent::Connected));
        tracker.set_state(b.id(), ConnectionState::Connected);
        assert_eq!(tracker.after_connected(true), None);
    }

    #[test]
    fn test_connect_event_after_all_answered() {
        let tracker = ConnectionStateTracker::new(true);
        let (a, b) = (sim("a"), sim("b"));
        tracker.register(a.clone());
        tracker.register(b.clone());
        tracker.begin_connect();
        tracker.set_state(a.id(), ConnectionState::Connecting);
        tracker.set_state(b.id(), ConnectionState::Connecting);

        tracker.set_state(a.id(), ConnectionState::Connected);
        assert_eq!(tracker.after_connected(false), None);
        tracker.set_state(b.id(), ConnectionState::Failed);
        assert_eq!(tracker.after_connect_answered(), Some(BasketEvent::Connected));
    }

    #[test]
    fn test_all_failed_reports_errors() {
        let tracker = ConnectionStateTracker::new(true);
        let a = sim("a");
        tracker.register(a.clone());
        tracker.begin_connect();
        tracker.set_state(a.id(), ConnectionState::Connecting);
        tracker.set_state(a.id(), ConnectionState::Failed);
        tracker.set_error(a.id(), ReplyError::connection("refused"));

        match tracker.after_connect_answered() {
            Some(BasketEvent::ConnectFailed(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_event_once_all_down() {
        let tracker = ConnectionStateTracker::new(true);
        let (a, b) = (sim("a"), sim("b"));
        tracker.register(a.clone());
        tracker.register(b.clone());
        tracker.set_state(a.id(), ConnectionState::Connected);
        tracker.set_state(b.id(), ConnectionState::Connected);

        tracker.set_state(a.id(), ConnectionState::Disconnected);
        assert_eq!(tracker.after_disconnected(), None);
        tracker.set_state(b.id(), ConnectionState::Failed);
        assert_eq!(tracker.after_disconnected(), Some(BasketEvent::Disconnected));
        assert_eq!(tracker.after_disconnected(), None);
    }

    #[test]
    fn test_heartbeat_default_and_override() {
        let tracker = ConnectionStateTracker::new(true);
        let a = sim("a");
        tracker.register(a.clone());
        assert!(tracker.heartbeat(a.id()));
        assert!(tracker.set_heartbeat(a.id(), false));
        assert!(!tracker.heartbeat(a.id()));
        assert!(!tracker.set_heartbeat(AdapterId::new(), true));
    }
}
