//! Connection manager.
//!
//! Connects, disconnects and resets the backends, wrapping each one in
//! its pipeline on connect, and hands messages to them. A message for a
//! backend that is still connecting waits in that backend's pending
//! queue and is replayed in arrival order once the backend connects.

use crate::connection_state::{ConnectionState, ConnectionStateTracker};
use crate::error::{RoutingError, RoutingResult};
use crate::pending::PendingMessageBuffer;
use basket_adapter::{MessageAdapter, PipelineBuilder};
use basket_core::{
    AdapterId, ConnectMessage, DisconnectMessage, Message, ReplyError, ResetMessage, TransactionId,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reply stream of a backend that was just (re)connected.
#[derive(Debug)]
pub struct BoundConnection {
    pub adapter: AdapterId,
    pub name: String,
    pub replies: mpsc::UnboundedReceiver<Message>,
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// Queued until the backend finishes connecting.
    Buffered,
}

pub struct ConnectionManager {
    tracker: Arc<ConnectionStateTracker>,
    pending: Arc<PendingMessageBuffer>,
    builder: RwLock<PipelineBuilder>,
}

impl ConnectionManager {
    pub fn new(
        tracker: Arc<ConnectionStateTracker>,
        pending: Arc<PendingMessageBuffer>,
        builder: PipelineBuilder,
    ) -> Self {
        Self {
            tracker,
            pending,
            builder: RwLock::new(builder),
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionStateTracker> {
        &self.tracker
    }

    pub fn add_adapter(&self, adapter: Arc<dyn MessageAdapter>) -> bool {
        self.tracker.register(adapter)
    }

    /// Unregister a backend, returning it with the messages still queued for it.
    pub fn remove_adapter(&self, id: AdapterId) -> Option<(Arc<dyn MessageAdapter>, Vec<Message>)> {
        let active = self.tracker.adapter(id)?;
        if self.tracker.state(id).is_some_and(|s| s.is_routable()) {
            if let Err(e) = active.send_in(DisconnectMessage::default().into()) {
                debug!(adapter = %active.name(), error = %e, "Disconnect on removal failed");
            }
        }
        let dropped = self.pending.take(id);
        let backend = self.tracker.unregister(id)?;
        Some((backend, dropped))
    }

    /// Connect every backend that is not already connected or connecting.
    ///
    /// Returns the new reply streams, plus the backends that failed
    /// synchronously.
    pub fn connect(&self) -> (Vec<BoundConnection>, Vec<(AdapterId, RoutingError)>) {
        self.tracker.begin_connect();
        let mut bound = Vec::new();
        let mut failed = Vec::new();
        for backend in self.tracker.backends() {
            let id = backend.id();
            if self.tracker.state(id).is_some_and(|s| s.is_routable()) {
                continue;
            }
            match self.connect_adapter(id) {
                Ok(connection) => bound.push(connection),
                Err(e) => failed.push((id, e)),
            }
        }
        (bound, failed)
    }

    /// Wrap one backend in a fresh pipeline and send it `Connect`.
    pub fn connect_adapter(&self, id: AdapterId) -> RoutingResult<BoundConnection> {
        let backend = self
            .tracker
            .backend(id)
            .ok_or(RoutingError::UnknownAdapter(id))?;
        let heartbeat = self.tracker.heartbeat(id);
        let pipeline: Arc<dyn MessageAdapter> =
            Arc::new(self.builder.read().build(backend.clone(), heartbeat));

        let (tx, rx) = mpsc::unbounded_channel();
        pipeline.bind(tx);
        self.tracker.set_active(id, pipeline.clone());
        self.tracker.set_state(id, ConnectionState::Connecting);
        info!(adapter = %backend.name(), heartbeat, "Connecting adapter");

        pipeline.send_in(ConnectMessage::default().into())?;
        Ok(BoundConnection {
            adapter: id,
            name: backend.name().to_string(),
            replies: rx,
        })
    }

    /// Send `Disconnect` to every connected or connecting backend.
    ///
    /// Returns the number of backends told.
    pub fn disconnect(&self) -> usize {
        self.tracker.begin_disconnect();
        let mut told = 0;
        for backend in self.tracker.backends() {
            let id = backend.id();
            if !self.tracker.state(id).is_some_and(|s| s.is_routable()) {
                continue;
            }
            let Some(adapter) = self.tracker.adapter(id) else {
                continue;
            };
            match adapter.send_in(DisconnectMessage::default().into()) {
                Ok(()) => told += 1,
                Err(e) => {
                    warn!(adapter = %adapter.name(), error = %e, "Disconnect failed");
                    self.tracker.set_state(id, ConnectionState::Disconnected);
                }
            }
        }
        told
    }

    /// Send `Reset` to every active backend and forget all connection state.
    pub fn reset(&self, transaction_id: TransactionId, clear_pending: bool) {
        for backend in self.tracker.backends() {
            let id = backend.id();
            if !self.tracker.state(id).is_some_and(|s| s.is_routable()) {
                continue;
            }
            if let Some(adapter) = self.tracker.adapter(id) {
                if let Err(e) = adapter.send_in(ResetMessage { transaction_id }.into()) {
                    warn!(adapter = %adapter.name(), error = %e, "Reset failed");
                }
            }
        }
        self.tracker.reset();
        if clear_pending {
            self.pending.clear();
        }
    }

    /// Hand `message` to a backend, queueing it while the backend connects.
    pub fn dispatch(&self, id: AdapterId, message: Message) -> RoutingResult<Dispatch> {
        let mut queue = self.pending.queue(id);
        let state = self
            .tracker
            .state(id)
            .ok_or(RoutingError::UnknownAdapter(id))?;
        match state {
            ConnectionState::Connected => {
                drop(queue);
                let adapter = self
                    .tracker
                    .adapter(id)
                    .ok_or(RoutingError::UnknownAdapter(id))?;
                adapter.send_in(message)?;
                Ok(Dispatch::Sent)
            }
            ConnectionState::Connecting => {
                debug!(adapter = %id, kind = %message.kind(), "Buffering until connected");
                queue.push_back(message);
                drop(queue);
                self.pending.report_connecting();
                Ok(Dispatch::Buffered)
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                drop(queue);
                let adapter = self
                    .tracker
                    .backend(id)
                    .map(|b| b.name().to_string())
                    .unwrap_or_else(|| id.to_string());
                Err(RoutingError::ConnectionUnavailable { adapter, state })
            }
        }
    }

    /// Mark a backend connected and replay its queue.
    ///
    /// Returns the queued messages the backend refused.
    pub fn on_connected(&self, id: AdapterId) -> Vec<(Message, RoutingError)> {
        let mut failed = Vec::new();
        {
            let mut queue = self.pending.queue(id);
            self.tracker.set_state(id, ConnectionState::Connected);
            let buffered: Vec<Message> = queue.drain(..).collect();
            match self.tracker.adapter(id) {
                Some(adapter) => {
                    if !buffered.is_empty() {
                        debug!(adapter = %adapter.name(), count = buffered.len(), "Replaying buffered messages");
                    }
                    for message in buffered {
                        if let Err(e) = adapter.send_in(message.clone()) {
                            failed.push((message, e.into()));
                        }
                    }
                }
                None => failed.extend(
                    buffered
                        .into_iter()
                        .map(|m| (m, RoutingError::UnknownAdapter(id))),
                ),
            }
        }
        self.pending.report_connecting();
        failed
    }

    /// Mark a backend failed; returns the messages that were waiting for it.
    pub fn on_connect_failed(&self, id: AdapterId, error: ReplyError) -> Vec<Message> {
        warn!(adapter = %id, error = %error, "Adapter failed to connect");
        self.tracker.set_state(id, ConnectionState::Failed);
        self.tracker.set_error(id, error);
        self.pending.take(id)
    }

    /// Mark a backend disconnected; returns the messages that were waiting for it.
    pub fn on_disconnected(&self, id: AdapterId, error: Option<ReplyError>) -> Vec<Message> {
        match &error {
            Some(e) => warn!(adapter = %id, error = %e, "Adapter disconnected"),
            None => info!(adapter = %id, "Adapter disconnected"),
        }
        self.tracker.set_state(id, ConnectionState::Disconnected);
        if let Some(error) = error {
            self.tracker.set_error(id, error);
        }
        self.pending.take(id)
    }

    /// Enable or disable heartbeat for a backend from its next connect.
    pub fn apply_heartbeat(&self, id: AdapterId, enabled: bool) -> RoutingResult<()> {
        if self.tracker.set_heartbeat(id, enabled) {
            debug!(adapter = %id, enabled, "Heartbeat setting applied");
            Ok(())
        } else {
            Err(RoutingError::UnknownAdapter(id))
        }
    }

    /// Pipelines built from now on skip latency and extra stages.
    pub fn set_ignore_extra_adapters(&self, ignore: bool) {
        self.builder.write().set_ignore_extra_adapters(ignore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_adapter::{PipelineConfig, SimAdapter};
    use basket_core::{Capabilities, InstrumentLookup, MessageKind};

    fn manager() -> ConnectionManager {
        let tracker = Arc::new(ConnectionStateTracker::new(false));
        let pending = Arc::new(PendingMessageBuffer::new());
        ConnectionManager::new(tracker, pending, PipelineBuilder::new(PipelineConfig::default()))
    }

    fn lookup(tx: u64) -> Message {
        InstrumentLookup::new(TransactionId::new(tx), None).into()
    }

    #[tokio::test]
    async fn test_buffers_until_connected_then_replays_in_order() {
        let manager = manager();
        let sim = Arc::new(SimAdapter::new(
            "sim",
            Capabilities::new().with_message_kind(MessageKind::InstrumentLookup),
        ));
        let id = sim.id();
        manager.add_adapter(sim.clone());

        let mut connection = manager.connect_adapter(id).unwrap();
        assert_eq!(manager.tracker().state(id), Some(ConnectionState::Connecting));
        assert_eq!(manager.dispatch(id, lookup(1)).unwrap(), Dispatch::Buffered);
        assert_eq!(manager.dispatch(id, lookup(2)).unwrap(), Dispatch::Buffered);
        assert!(sim.received_of(MessageKind::InstrumentLookup).is_empty());

        let reply = connection.replies.recv().await.unwrap();
        assert!(matches!(reply, Message::Connect(ref c) if c.error.is_none()));

        assert!(manager.on_connected(id).is_empty());
        let ids: Vec<_> = sim
            .received_of(MessageKind::InstrumentLookup)
            .iter()
            .filter_map(|m| m.transaction_id())
            .collect();
        assert_eq!(ids, vec![TransactionId::new(1), TransactionId::new(2)]);
        assert_eq!(manager.dispatch(id, lookup(3)).unwrap(), Dispatch::Sent);
    }

    #[tokio::test]
    async fn test_dispatch_to_disconnected_is_error() {
        let manager = manager();
        let sim = Arc::new(SimAdapter::new("sim", Capabilities::new()));
        let id = sim.id();
        manager.add_adapter(sim);

        let err = manager.dispatch(id, lookup(1)).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::ConnectionUnavailable {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
        assert!(matches!(
            manager.dispatch(AdapterId::new(), lookup(1)),
            Err(RoutingError::UnknownAdapter(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_drops_queue() {
        let manager = manager();
        let sim = Arc::new(SimAdapter::new("sim", Capabilities::new()));
        let id = sim.id();
        manager.add_adapter(sim);
        let _connection = manager.connect_adapter(id).unwrap();
        manager.dispatch(id, lookup(1)).unwrap();

        let dropped = manager.on_disconnected(id, Some(ReplyError::connection("lost")));
        assert_eq!(dropped.len(), 1);
        assert_eq!(manager.tracker().state(id), Some(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_skips_active_backends() {
        let manager = manager();
        let a = Arc::new(SimAdapter::new("a", Capabilities::new()));
        let b = Arc::new(SimAdapter::new("b", Capabilities::new()));
        manager.add_adapter(a.clone());
        manager.add_adapter(b.clone());

        let (bound, failed) = manager.connect();
        assert_eq!(bound.len(), 2);
        assert!(failed.is_empty());

        let (bound, _) = manager.connect();
        assert!(bound.is_empty());
    }

    #[tokio::test]
    async fn test_apply_heartbeat_unknown_adapter() {
        let manager = manager();
        assert!(manager.apply_heartbeat(AdapterId::new(), true).is_err());
    }
}
