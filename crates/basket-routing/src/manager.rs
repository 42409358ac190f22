//! Basket routing manager.
//!
//! Single dispatch path for both directions:
//! - `process_in` routes a caller request to backends (fan-out, failover,
//!   single destination or broadcast)
//! - `process_out` folds a backend reply into routing state and rewrites
//!   it into the caller's id space
//!
//! Neither direction awaits a backend. Results come back as a
//! `ProcessOutput`: replies for the caller, parked requests to loop back
//! through `process_in`, and reply streams of newly connected backends.

use crate::config::RouterConfig;
use crate::connection_manager::{BoundConnection, ConnectionManager};
use crate::connection_state::{BasketEvent, ConnectionSnapshot, ConnectionStateTracker};
use crate::error::{RoutingError, RoutingResult};
use crate::order_routing::OrderRoutingState;
use crate::parent_child::{ChildOutcome, ChildState, ParentChildMap, ParentEvent, Resolution, Translation};
use crate::pending::PendingMessageBuffer;
use crate::router::AdapterRouter;
use crate::subscription_routing::SubscriptionRoutingState;
use basket_adapter::{underlying_adapter, MessageAdapter, PipelineBuilder};
use basket_core::{
    AdapterId, ConnectMessage, DataKind, DisconnectMessage, DispatchPolicy, ErrorMessage,
    IdGenerator, Message, ReplyError, SubscriptionResponse, TransactionId,
};
use basket_telemetry::Metrics;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Shared routing tables, each behind its own lock.
#[derive(Clone)]
pub struct RoutingState {
    pub tracker: Arc<ConnectionStateTracker>,
    pub pending: Arc<PendingMessageBuffer>,
    pub parent_child: Arc<ParentChildMap>,
    pub subscriptions: Arc<SubscriptionRoutingState>,
    pub orders: Arc<OrderRoutingState>,
}

impl RoutingState {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            tracker: Arc::new(ConnectionStateTracker::new(config.heartbeat_enabled)),
            pending: Arc::new(PendingMessageBuffer::new()),
            parent_child: Arc::new(ParentChildMap::new(config.retired_id_capacity)),
            subscriptions: Arc::new(SubscriptionRoutingState::new()),
            orders: Arc::new(OrderRoutingState::new()),
        }
    }
}

enum FailoverStep {
    Sent,
    DispatchFailed(AdapterId),
    Exhausted { declined: usize },
}

/// Everything a processing step produced.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    /// Replies for the caller, in order.
    pub out: Vec<Message>,
    /// Parked requests to feed back into `process_in`.
    pub loopback: Vec<Message>,
    /// Reply streams of backends that were just connected.
    pub connections: Vec<BoundConnection>,
}

impl ProcessOutput {
    pub fn is_empty(&self) -> bool {
        self.out.is_empty() && self.loopback.is_empty() && self.connections.is_empty()
    }
}

pub struct BasketRoutingManager {
    config: RouterConfig,
    ids: Arc<IdGenerator>,
    state: RoutingState,
    router: AdapterRouter,
    connections: ConnectionManager,
}

impl BasketRoutingManager {
    pub fn new(
        config: RouterConfig,
        ids: Arc<IdGenerator>,
        state: RoutingState,
        builder: PipelineBuilder,
    ) -> Self {
        let router = AdapterRouter::new(state.tracker.clone(), state.orders.clone());
        let connections =
            ConnectionManager::new(state.tracker.clone(), state.pending.clone(), builder);
        Self {
            config,
            ids,
            state,
            router,
            connections,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn transaction_ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn state(&self) -> &RoutingState {
        &self.state
    }

    pub fn connection_states(&self) -> Vec<ConnectionSnapshot> {
        self.state.tracker.snapshot()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.state.tracker.backends()
    }

    /// Parent ids of live subscriptions to `data_kind`.
    pub fn subscribers(&self, data_kind: DataKind) -> Vec<TransactionId> {
        let mut ids = self.state.parent_child.subscribers(data_kind);
        ids.extend(
            self.state
                .subscriptions
                .subscribers(data_kind)
                .into_iter()
                .map(|(tx, _)| tx),
        );
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn apply_heartbeat(&self, adapter: AdapterId, enabled: bool) -> RoutingResult<()> {
        self.connections.apply_heartbeat(adapter, enabled)
    }

    pub fn set_ignore_extra_adapters(&self, ignore: bool) {
        self.connections.set_ignore_extra_adapters(ignore);
    }

    /// Register a backend, connecting it right away if the basket is connected.
    ///
    /// Decorated adapters are unwrapped down to the connection that
    /// presents itself as the backend; both must share one id.
    pub fn add_adapter(&self, adapter: Arc<dyn MessageAdapter>) -> RoutingResult<ProcessOutput> {
        let mut output = ProcessOutput::default();
        let id = adapter.id();
        let backend = underlying_adapter(&adapter);
        if backend.id() != id {
            warn!(adapter = %adapter.name(), backend = %backend.name(), "Wrapper hides its backend id");
            return Err(RoutingError::IdentityMismatch {
                adapter: adapter.name().to_string(),
                backend: backend.name().to_string(),
            });
        }
        if !self.connections.add_adapter(adapter) {
            debug!(adapter = %id, "Adapter already registered");
            return Ok(output);
        }
        if self.state.tracker.connect_requested() {
            match self.connections.connect_adapter(id) {
                Ok(connection) => output.connections.push(connection),
                Err(e) => self.adapter_connect_failed(id, e.to_reply_error(), &mut output)?,
            }
        }
        Ok(output)
    }

    /// Unregister a backend, failing everything it was serving.
    pub fn remove_adapter(&self, id: AdapterId) -> RoutingResult<ProcessOutput> {
        let mut output = ProcessOutput::default();
        let (backend, dropped) = self
            .connections
            .remove_adapter(id)
            .ok_or(RoutingError::UnknownAdapter(id))?;
        info!(adapter = %backend.name(), "Removed adapter");
        let error = ReplyError::connection(format!("adapter {} removed", backend.name()));
        self.fail_adapter_traffic(id, dropped, &error, true, &mut output)?;
        self.state.orders.forget_adapter(id);
        Ok(output)
    }

    /// Route a caller request.
    pub fn process_in(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> RoutingResult<ProcessOutput> {
        let mut output = ProcessOutput::default();
        if cancel.is_cancelled() {
            debug!(kind = %message.kind(), "Request canceled before dispatch");
            if let Some(reply) = message.error_reply(ReplyError::canceled()) {
                output.out.push(reply);
            }
            return Ok(output);
        }

        trace!(kind = %message.kind(), tx = ?message.transaction_id(), "Inbound");
        match message {
            Message::Connect(_) => self.connect(&mut output)?,
            Message::Disconnect(_) => self.disconnect(&mut output),
            Message::Reset(reset) => self.reset(reset.transaction_id),
            Message::Time(_) => self.broadcast(message),
            Message::InstrumentLookup(_) | Message::PortfolioLookup(_) | Message::OrderStatus(_) => {
                if message.is_subscribe() {
                    self.fan_out(message, cancel, &mut output)?;
                } else {
                    self.unsubscribe(message, &mut output)?;
                }
            }
            Message::MarketData(_) => {
                let policy = message.data_kind().map(|k| k.dispatch_policy());
                if !message.is_subscribe() {
                    self.unsubscribe(message, &mut output)?;
                } else if policy == Some(DispatchPolicy::Failover) {
                    self.failover(message, &mut output)?;
                } else {
                    self.fan_out(message, cancel, &mut output)?;
                }
            }
            Message::OrderRegister(_) => self.register_order(message, &mut output),
            Message::OrderCancel(_) | Message::OrderReplace(_) => {
                self.follow_up_order(message, &mut output)
            }
            Message::SubscriptionResponse(_)
            | Message::SubscriptionOnline(_)
            | Message::SubscriptionFinished(_)
            | Message::Instrument(_)
            | Message::Portfolio(_)
            | Message::Execution(_)
            | Message::Quote(_)
            | Message::Level1(_)
            | Message::Candle(_)
            | Message::News(_)
            | Message::Error(_) => return Err(RoutingError::UnexpectedInbound(message.kind())),
        }
        Ok(output)
    }

    /// Fold a backend reply into routing state.
    pub fn process_out(&self, adapter: AdapterId, message: Message) -> RoutingResult<ProcessOutput> {
        let mut output = ProcessOutput::default();
        trace!(%adapter, kind = %message.kind(), "Outbound");
        match message {
            Message::Connect(connect) => match connect.error {
                None => self.adapter_connected(adapter, &mut output)?,
                Some(error) => self.adapter_connect_failed(adapter, error, &mut output)?,
            },
            Message::Disconnect(disconnect) => {
                self.adapter_disconnected(adapter, disconnect.error, &mut output)?
            }
            Message::SubscriptionResponse(_)
            | Message::SubscriptionOnline(_)
            | Message::SubscriptionFinished(_) => {
                self.subscription_reply(adapter, message, &mut output)?
            }
            Message::Error(mut error) => {
                if let Some(id) = error.original_transaction_id {
                    match self.state.parent_child.translate(id) {
                        Translation::Parent(parent) => error.original_transaction_id = Some(parent),
                        Translation::Retired => {
                            Metrics::reply_dropped("retired");
                            return Ok(output);
                        }
                        Translation::Unknown => {}
                    }
                }
                output.out.push(error.into());
            }
            Message::Time(_) => output.out.push(message),
            Message::Instrument(_)
            | Message::Portfolio(_)
            | Message::Execution(_)
            | Message::Quote(_)
            | Message::Level1(_)
            | Message::Candle(_)
            | Message::News(_) => self.data(adapter, message, &mut output),
            Message::Reset(_)
            | Message::InstrumentLookup(_)
            | Message::PortfolioLookup(_)
            | Message::OrderStatus(_)
            | Message::MarketData(_)
            | Message::OrderRegister(_)
            | Message::OrderCancel(_)
            | Message::OrderReplace(_) => {
                warn!(%adapter, kind = %message.kind(), "Adapter sent a request outward; dropped");
                Metrics::reply_dropped("request");
            }
        }
        Ok(output)
    }

    fn connect(&self, output: &mut ProcessOutput) -> RoutingResult<()> {
        if self.state.tracker.is_empty() {
            warn!("Connect requested with no adapters registered");
            output.out.push(
                ConnectMessage {
                    error: Some(ReplyError::routing_miss("no adapters registered")),
                }
                .into(),
            );
            return Ok(());
        }
        let (bound, failed) = self.connections.connect();
        info!(connecting = bound.len(), failed = failed.len(), "Connecting basket");
        output.connections.extend(bound);
        for (id, error) in failed {
            self.adapter_connect_failed(id, error.to_reply_error(), output)?;
        }
        // Everything was connected already.
        if !self.state.tracker.has_connecting() {
            if let Some(event) = self.state.tracker.after_connect_answered() {
                output.out.push(event_message(event));
            }
        }
        Ok(())
    }

    fn disconnect(&self, output: &mut ProcessOutput) {
        let told = self.connections.disconnect();
        info!(adapters = told, "Disconnecting basket");
        if told == 0 {
            if let Some(event) = self.state.tracker.after_disconnected() {
                output.out.push(event_message(event));
            }
        }
    }

    fn reset(&self, transaction_id: TransactionId) {
        info!(%transaction_id, "Resetting basket");
        self.connections
            .reset(transaction_id, self.config.clear_pending_on_reset);
        self.state.parent_child.clear();
        self.state.subscriptions.clear();
        self.state.orders.reset();
    }

    /// Send to every connected backend.
    fn broadcast(&self, message: Message) {
        for adapter in self.state.tracker.connected() {
            if let Err(e) = adapter.send_in(message.clone()) {
                warn!(adapter = %adapter.name(), error = %e, "Broadcast failed");
            }
        }
        Metrics::request_routed(message.kind().as_str(), "broadcast");
    }

    fn fan_out(
        &self,
        message: Message,
        cancel: &CancellationToken,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        let kind = message.kind();
        let destinations = self.router.select_destinations(&message, &HashSet::new());
        if destinations.is_empty() {
            return self.unroutable(message, output);
        }

        let parent = self.state.parent_child.begin(&message)?;
        Metrics::request_routed(kind.as_str(), "fanout");
        Metrics::fanout_children(kind.as_str(), destinations.len());

        let mut canceled = false;
        for destination in destinations {
            if cancel.is_cancelled() {
                canceled = true;
                break;
            }
            let child = self.ids.next_id();
            let child_message = message
                .to_child(child, None, destination.build_from)
                .ok_or_else(|| RoutingError::invariant(format!("{kind} cannot be fanned out")))?;
            self.state
                .parent_child
                .add_mapping(parent, child, destination.id())?;
            debug!(%parent, %child, adapter = %destination.adapter.name(), "Dispatching child");
            if let Err(e) = self.connections.dispatch(destination.id(), child_message) {
                warn!(%child, adapter = %destination.adapter.name(), error = %e, "Child dispatch failed");
                let events = self.state.parent_child.resolve(
                    child,
                    destination.id(),
                    ChildOutcome::Failed(e.to_reply_error()),
                )?;
                self.emit_resolution(events, output);
            }
        }

        let events = if canceled {
            self.state.parent_child.cancel(parent)
        } else {
            self.state.parent_child.seal(parent)
        };
        self.emit(events, output);
        Ok(())
    }

    fn unsubscribe(&self, message: Message, output: &mut ProcessOutput) -> RoutingResult<()> {
        let Some(tx) = message.transaction_id() else {
            return Err(RoutingError::invariant("unsubscribe without transaction id"));
        };
        let Some(original) = message.original_transaction_id() else {
            if let Some(reply) =
                message.error_reply(ReplyError::rejected("unsubscribe without subscription id"))
            {
                output.out.push(reply);
            }
            return Ok(());
        };
        Metrics::request_routed(message.kind().as_str(), "unsubscribe");

        if let Some((request, children)) = self.state.parent_child.retire_parent(original) {
            debug!(%original, kind = %request.kind(), children = children.len(), "Unsubscribing fan-out");
            if children.is_empty() {
                output.out.push(SubscriptionResponse::ok(tx).into());
                return Ok(());
            }
            self.state.parent_child.begin(&message)?;
            for (old_child, adapter) in children {
                let child = self.ids.next_id();
                let child_message = message
                    .to_child(child, Some(old_child), None)
                    .ok_or_else(|| RoutingError::invariant("unsubscribe cannot be fanned out"))?;
                self.state.parent_child.add_mapping(tx, child, adapter)?;
                if let Err(e) = self.connections.dispatch(adapter, child_message) {
                    debug!(%child, %adapter, error = %e, "Unsubscribe dispatch failed");
                    let events = self.state.parent_child.resolve(
                        child,
                        adapter,
                        ChildOutcome::Failed(e.to_reply_error()),
                    )?;
                    self.emit_resolution(events, output);
                }
            }
            let events = self.state.parent_child.seal(tx);
            self.emit(events, output);
            return Ok(());
        }

        if let Some(entry) = self.state.subscriptions.finish(original) {
            self.state.parent_child.retire(original, ChildState::Unsubscribed);
            match entry.current {
                Some(adapter) => {
                    debug!(%original, %adapter, "Unsubscribing failover subscription");
                    if let Err(e) = self.connections.dispatch(adapter, message.clone()) {
                        if let Some(reply) = message.error_reply(e.to_reply_error()) {
                            output.out.push(reply);
                        }
                    }
                }
                None => output.out.push(SubscriptionResponse::ok(tx).into()),
            }
            return Ok(());
        }

        if self.state.pending.remove_unrouted(original).is_some() {
            debug!(%original, "Unsubscribed a parked request");
            output.out.push(SubscriptionResponse::ok(tx).into());
            return Ok(());
        }

        debug!(%original, "Unsubscribe for unknown subscription ignored");
        Ok(())
    }

    fn failover(&self, message: Message, output: &mut ProcessOutput) -> RoutingResult<()> {
        let Some(tx) = message.transaction_id() else {
            return Err(RoutingError::invariant("failover request without transaction id"));
        };
        if self.state.subscriptions.begin(tx, &message) {
            self.dispatch_failover(tx, output)
        } else {
            if let Some(reply) =
                message.error_reply(ReplyError::rejected(format!("transaction {tx} already in use")))
            {
                output.out.push(reply);
            }
            Ok(())
        }
    }

    /// Send a failover request to the next backend that has not declined it.
    fn dispatch_failover(&self, tx: TransactionId, output: &mut ProcessOutput) -> RoutingResult<()> {
        let step = {
            let Some(mut entry) = self.state.subscriptions.resume(tx) else {
                debug!(%tx, "Failover request gone, retry dropped");
                Metrics::reply_dropped("finished");
                return Ok(());
            };
            let destination = self
                .router
                .select_destinations(&entry.request, &entry.not_supported)
                .into_iter()
                .next();
            let declined = entry.not_supported.len();
            match destination {
                None => FailoverStep::Exhausted { declined },
                Some(destination) => {
                    let mut outgoing = entry.request.clone();
                    if let Message::MarketData(request) = &mut outgoing {
                        request.build_from = destination.build_from;
                        request.header.adapter = None;
                    }
                    entry.assign(destination.id());
                    Metrics::request_routed(outgoing.kind().as_str(), "failover");
                    debug!(%tx, adapter = %destination.adapter.name(), attempt = entry.attempts, "Dispatching failover request");
                    // Dispatched under the entry guard: an unsubscribe
                    // finishing this entry always reaches the backend second.
                    match self.connections.dispatch(destination.id(), outgoing) {
                        Ok(_) => FailoverStep::Sent,
                        Err(e) => {
                            warn!(%tx, adapter = %destination.adapter.name(), error = %e, "Failover dispatch failed");
                            FailoverStep::DispatchFailed(destination.id())
                        }
                    }
                }
            }
        };

        match step {
            FailoverStep::Sent => Ok(()),
            FailoverStep::DispatchFailed(adapter) => self.retry_failover(tx, adapter, output),
            FailoverStep::Exhausted { declined } => {
                let Some(entry) = self.state.subscriptions.finish(tx) else {
                    return Ok(());
                };
                let message = entry.request;
                if declined == 0 {
                    return self.unroutable(message, output);
                }
                debug!(%tx, declined, "No adapter left to try");
                let data_kind = message
                    .data_kind()
                    .map_or_else(|| "request".to_string(), |k| k.to_string());
                if let Some(reply) = message.error_reply(ReplyError::not_supported(format!(
                    "no adapter supports {data_kind}"
                ))) {
                    output.out.push(reply);
                }
                Ok(())
            }
        }
    }

    fn register_order(&self, message: Message, output: &mut ProcessOutput) {
        let destinations = self.router.select_destinations(&message, &HashSet::new());
        let Some(destination) = destinations.into_iter().next() else {
            if let Err(e) = self.unroutable(message, output) {
                warn!(error = %e, "Order could not be parked");
            }
            return;
        };
        if let Some(tx) = message.transaction_id() {
            self.state.orders.record_order(tx, destination.id());
        }
        Metrics::request_routed(message.kind().as_str(), "single");
        debug!(tx = ?message.transaction_id(), adapter = %destination.adapter.name(), "Routing order");
        if let Err(e) = self.connections.dispatch(destination.id(), message.clone()) {
            warn!(adapter = %destination.adapter.name(), error = %e, "Order dispatch failed");
            if let Some(reply) = message.error_reply(e.to_reply_error()) {
                output.out.push(reply);
            }
        }
    }

    /// Cancel or replace: goes wherever the original order went.
    fn follow_up_order(&self, message: Message, output: &mut ProcessOutput) {
        let kind = message.kind();
        let owner = message
            .original_transaction_id()
            .and_then(|original| self.state.orders.order_adapter(original));
        let Some(adapter) = owner else {
            Metrics::routing_miss(kind.as_str());
            let original = message
                .original_transaction_id()
                .map_or_else(|| "?".to_string(), |id| id.to_string());
            debug!(%kind, %original, "Unknown order");
            if let Some(reply) =
                message.error_reply(ReplyError::routing_miss(format!("unknown order {original}")))
            {
                output.out.push(reply);
            }
            return;
        };
        // Reports for the follow-up carry its own id.
        if let Some(tx) = message.transaction_id() {
            self.state.orders.record_order(tx, adapter);
        }
        Metrics::request_routed(kind.as_str(), "single");
        if let Err(e) = self.connections.dispatch(adapter, message.clone()) {
            warn!(%adapter, error = %e, "Order dispatch failed");
            if let Some(reply) = message.error_reply(e.to_reply_error()) {
                output.out.push(reply);
            }
        }
    }

    /// No backend can take `message` now: park it or fail it.
    fn unroutable(&self, message: Message, output: &mut ProcessOutput) -> RoutingResult<()> {
        let kind = message.kind();
        let tracker = &self.state.tracker;
        if tracker.is_empty() || tracker.has_connecting() {
            debug!(%kind, tx = ?message.transaction_id(), "No adapter yet, parking request");
            Metrics::request_routed(kind.as_str(), "parked");
            self.state.pending.park(message);
            return Ok(());
        }

        Metrics::routing_miss(kind.as_str());
        let error = if tracker.any_connected() {
            ReplyError::routing_miss(format!("no adapter accepts {kind}"))
        } else {
            ReplyError::connection("no connected adapter")
        };
        debug!(%kind, tx = ?message.transaction_id(), error = %error, "Request unroutable");
        if let Some(reply) = message.error_reply(error) {
            output.out.push(reply);
        }
        Ok(())
    }

    fn subscription_reply(
        &self,
        adapter: AdapterId,
        message: Message,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        let (Some(tx), Some(outcome)) = (
            message.original_transaction_id(),
            ChildOutcome::from_reply(&message),
        ) else {
            return Err(RoutingError::invariant(format!(
                "{} without subscription outcome",
                message.kind()
            )));
        };

        match self.state.parent_child.resolve(tx, adapter, outcome)? {
            Resolution::Events(events) => self.emit(events, output),
            Resolution::Retired => {
                trace!(%tx, kind = %message.kind(), "Reply for retired child dropped");
                Metrics::reply_dropped("retired");
            }
            Resolution::NotChild => self.failover_reply(adapter, tx, message, output)?,
        }
        Ok(())
    }

    /// Replies that are not children: failover subscriptions, unsubscribe
    /// answers and anything else already in the caller's id space.
    fn failover_reply(
        &self,
        adapter: AdapterId,
        tx: TransactionId,
        message: Message,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        if self.state.subscriptions.contains(tx) {
            match &message {
                Message::SubscriptionResponse(r)
                    if r.error.as_ref().is_some_and(|e| e.is_not_supported()) =>
                {
                    return self.retry_failover(tx, adapter, output);
                }
                Message::SubscriptionResponse(r) if r.error.is_some() => {
                    self.state.subscriptions.finish(tx);
                }
                Message::SubscriptionFinished(_) => {
                    self.state.subscriptions.finish(tx);
                }
                _ => {}
            }
        }
        output.out.push(message);
        Ok(())
    }

    /// Exclude `adapter` for a failover request and try the next one.
    ///
    /// Ignored once the request is gone or `adapter` no longer serves it.
    fn retry_failover(
        &self,
        tx: TransactionId,
        adapter: AdapterId,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        if !self.state.subscriptions.mark_not_supported(tx, adapter)? {
            return Ok(());
        }
        let data_kind = self.state.subscriptions.data_kind(tx);
        Metrics::not_supported_retry(data_kind.map_or("unknown", |k| k.as_str()));
        debug!(%tx, %adapter, "Retrying failover request elsewhere");
        self.dispatch_failover(tx, output)
    }

    fn data(&self, adapter: AdapterId, mut message: Message, output: &mut ProcessOutput) {
        if self.config.learn_routes_from_replies {
            self.learn_route(adapter, &message);
        }
        if let Some(ids) = message.subscription_ids_mut() {
            let owned: HashSet<TransactionId> =
                ids.iter().filter(|id| self.serves(adapter, *id)).collect();
            if !self.state.parent_child.rewrite(ids, &owned) {
                trace!(%adapter, kind = %message.kind(), "Data for unknown or retired subscription dropped");
                Metrics::reply_dropped("stale");
                return;
            }
        }
        output.out.push(message);
    }

    /// Whether `id` is a caller transaction that `adapter` is serving
    /// directly: a failover subscription or an order.
    fn serves(&self, adapter: AdapterId, id: TransactionId) -> bool {
        self.state.subscriptions.current(id) == Some(adapter)
            || self.state.orders.order_adapter(id) == Some(adapter)
    }

    fn learn_route(&self, adapter: AdapterId, message: &Message) {
        let orders = &self.state.orders;
        match message {
            Message::Portfolio(p) if orders.portfolio_adapter(&p.portfolio).is_none() => {
                debug!(portfolio = %p.portfolio, %adapter, "Learned portfolio route");
                orders.set_portfolio_adapter(&p.portfolio, adapter);
            }
            Message::Instrument(i) if orders.security_adapter(&i.security_id, None).is_none() => {
                debug!(security = %i.security_id, %adapter, "Learned security route");
                orders.set_security_adapter(i.security_id.clone(), None, adapter);
            }
            _ => {}
        }
    }

    fn adapter_connected(&self, adapter: AdapterId, output: &mut ProcessOutput) -> RoutingResult<()> {
        info!(%adapter, "Adapter connected");
        for (message, error) in self.connections.on_connected(adapter) {
            self.undeliverable(adapter, message, error.to_reply_error(), output)?;
        }
        output.loopback.extend(self.state.pending.take_unrouted());
        if self.state.tracker.connect_requested() {
            if let Some(event) = self
                .state
                .tracker
                .after_connected(self.config.connect_event_on_first_adapter)
            {
                output.out.push(event_message(event));
            }
        }
        Ok(())
    }

    fn adapter_connect_failed(
        &self,
        adapter: AdapterId,
        error: ReplyError,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        let dropped = self.connections.on_connect_failed(adapter, error.clone());
        self.fail_adapter_traffic(adapter, dropped, &error, true, output)?;
        if !self.state.tracker.has_connecting() {
            if let Some(event) = self.state.tracker.after_connect_answered() {
                output.out.push(event_message(event));
            }
            output.loopback.extend(self.state.pending.take_unrouted());
        }
        Ok(())
    }

    fn adapter_disconnected(
        &self,
        adapter: AdapterId,
        error: Option<ReplyError>,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        let unexpected = self.state.tracker.connect_requested();
        let dropped = self.connections.on_disconnected(adapter, error.clone());
        let error = error.unwrap_or_else(|| ReplyError::connection("adapter disconnected"));
        self.fail_adapter_traffic(adapter, dropped, &error, unexpected, output)?;
        if let Some(event) = self.state.tracker.after_disconnected() {
            output.out.push(event_message(event));
        }
        Ok(())
    }

    /// Fail whatever `adapter` was serving.
    ///
    /// Failover subscriptions move to another backend when `retry` is set
    /// and end with an error otherwise.
    fn fail_adapter_traffic(
        &self,
        adapter: AdapterId,
        dropped: Vec<Message>,
        error: &ReplyError,
        retry: bool,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        for message in dropped {
            self.undeliverable(adapter, message, error.clone(), output)?;
        }
        let events = self.state.parent_child.fail_adapter(adapter, error);
        self.emit(events, output);
        for tx in self.state.subscriptions.entries_on(adapter) {
            if retry {
                self.retry_failover(tx, adapter, output)?;
            } else {
                self.state.subscriptions.finish(tx);
                output.out.push(
                    ErrorMessage {
                        original_transaction_id: Some(tx),
                        error: error.clone(),
                    }
                    .into(),
                );
            }
        }
        Ok(())
    }

    /// A message that never reached `adapter`.
    fn undeliverable(
        &self,
        adapter: AdapterId,
        message: Message,
        error: ReplyError,
        output: &mut ProcessOutput,
    ) -> RoutingResult<()> {
        if let Some(tx) = message.transaction_id() {
            match self
                .state
                .parent_child
                .resolve(tx, adapter, ChildOutcome::Failed(error.clone()))?
            {
                Resolution::Events(events) => {
                    self.emit(events, output);
                    return Ok(());
                }
                Resolution::Retired => return Ok(()),
                Resolution::NotChild => {}
            }
            if self.state.subscriptions.current(tx) == Some(adapter) {
                return self.retry_failover(tx, adapter, output);
            }
        }
        if let Some(reply) = message.error_reply(error) {
            output.out.push(reply);
        }
        Ok(())
    }

    fn emit_resolution(&self, resolution: Resolution, output: &mut ProcessOutput) {
        if let Resolution::Events(events) = resolution {
            self.emit(events, output);
        }
    }

    fn emit(&self, events: Vec<ParentEvent>, output: &mut ProcessOutput) {
        for event in events {
            if matches!(event, ParentEvent::Response { .. } | ParentEvent::Failed { .. }) {
                Metrics::aggregated_reply(event.outcome());
            }
            debug!(parent = %event.parent(), outcome = event.outcome(), "Parent resolved");
            output.out.push(event.into_message());
        }
    }
}

fn event_message(event: BasketEvent) -> Message {
    match event {
        BasketEvent::Connected => ConnectMessage::default().into(),
        BasketEvent::ConnectFailed(errors) => ConnectMessage {
            error: Some(ReplyError::aggregate("no adapter connected", errors)),
        }
        .into(),
        BasketEvent::Disconnected => DisconnectMessage::default().into(),
    }
}
