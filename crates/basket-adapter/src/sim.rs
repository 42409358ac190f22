//! In-memory simulated backend.
//!
//! Answers every request inline through its bound channel, following a
//! configurable behaviour: declining data kinds, failing to connect,
//! rejecting subscriptions, or staying silent. Every inbound message is
//! recorded so tests can assert on exactly what the router sent.

use crate::adapter::MessageAdapter;
use crate::error::{AdapterError, AdapterResult};
use basket_core::{
    AdapterId, CandleData, Capabilities, ConnectMessage, DataKind, DisconnectMessage,
    ExecutionData, ExecutionKind, InstrumentData, Level1Data, Message, MessageKind, NewsData,
    OrderState, PortfolioData, QuoteData, QuoteLevel, ReplyError, SecurityId,
    SubscriptionFinished, SubscriptionIds, SubscriptionOnline, SubscriptionResponse, TimeMessage,
    TransactionId,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a simulated backend answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimBehavior {
    /// Answer connect with an error.
    #[serde(default)]
    pub fail_connect: bool,
    /// Market-data kinds answered with "not supported".
    #[serde(default)]
    pub decline: HashSet<DataKind>,
    /// Answer every subscription with this rejection.
    #[serde(default)]
    pub reject_with: Option<String>,
    /// Record requests but never answer them (connect excepted).
    #[serde(default)]
    pub silent: bool,
    /// Instruments served by lookups.
    #[serde(default)]
    pub securities: Vec<SecurityId>,
    /// Portfolios served by lookups.
    #[serde(default)]
    pub portfolios: Vec<String>,
}

struct ActiveSubscription {
    data_kind: DataKind,
    security_id: Option<SecurityId>,
}

struct SimOrder {
    security_id: SecurityId,
    portfolio: String,
    state: OrderState,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    received: Vec<Message>,
    subscriptions: BTreeMap<TransactionId, ActiveSubscription>,
    orders: HashMap<TransactionId, SimOrder>,
}

/// Simulated backend connection.
pub struct SimAdapter {
    id: AdapterId,
    name: String,
    capabilities: RwLock<Capabilities>,
    behavior: RwLock<SimBehavior>,
    out: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    state: Mutex<SimState>,
}

impl SimAdapter {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self::with_behavior(name, capabilities, SimBehavior::default())
    }

    pub fn with_behavior(
        name: impl Into<String>,
        capabilities: Capabilities,
        behavior: SimBehavior,
    ) -> Self {
        Self {
            id: AdapterId::new(),
            name: name.into(),
            capabilities: RwLock::new(capabilities),
            behavior: RwLock::new(behavior),
            out: RwLock::new(None),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.write() = capabilities;
    }

    pub fn set_behavior(&self, behavior: SimBehavior) {
        *self.behavior.write() = behavior;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Every message received so far.
    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    /// Received messages of one kind.
    pub fn received_of(&self, kind: MessageKind) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    /// Ids of live market-data subscriptions, in ascending order.
    pub fn active_subscriptions(&self) -> Vec<TransactionId> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    /// Send an arbitrary message outward.
    pub fn emit(&self, message: Message) -> AdapterResult<()> {
        let out = self.out.read();
        let out = out
            .as_ref()
            .ok_or_else(|| AdapterError::NotBound(self.name.clone()))?;
        out.send(message)
            .map_err(|_| AdapterError::ChannelClosed(self.name.clone()))
    }

    /// Emit one data message for every live subscription.
    ///
    /// Returns the number of messages emitted.
    pub fn publish_market_data(&self, price: Decimal) -> AdapterResult<usize> {
        let messages: Vec<Message> = {
            let state = self.state.lock();
            state
                .subscriptions
                .iter()
                .map(|(tx, sub)| market_data_message(*tx, sub, price))
                .collect()
        };
        let count = messages.len();
        for message in messages {
            self.emit(message)?;
        }
        Ok(count)
    }

    fn reply(&self, message: Message) -> AdapterResult<()> {
        if self.behavior.read().silent && !matches!(message, Message::Connect(_)) {
            return Ok(());
        }
        self.emit(message)
    }

    fn handle(&self, message: &Message) -> AdapterResult<()> {
        match message {
            Message::Connect(_) => {
                if self.behavior.read().fail_connect {
                    return self.reply(Message::Connect(ConnectMessage {
                        error: Some(ReplyError::connection(format!(
                            "{} refused connection",
                            self.name
                        ))),
                    }));
                }
                self.state.lock().connected = true;
                self.reply(Message::Connect(ConnectMessage::default()))
            }
            Message::Disconnect(_) => {
                {
                    let mut state = self.state.lock();
                    state.connected = false;
                    state.subscriptions.clear();
                }
                self.reply(Message::Disconnect(DisconnectMessage::default()))
            }
            Message::Reset(_) => {
                let mut state = self.state.lock();
                state.subscriptions.clear();
                state.orders.clear();
                Ok(())
            }
            Message::Time(t) => match t.transaction_id {
                Some(tx) => self.reply(Message::Time(TimeMessage {
                    transaction_id: None,
                    original_transaction_id: Some(tx),
                    server_time: Utc::now(),
                })),
                None => Ok(()),
            },
            Message::InstrumentLookup(lookup) => {
                let tx = lookup.header.transaction_id;
                if let Some(rejection) = self.rejection() {
                    return self.reply(SubscriptionResponse::error(tx, rejection).into());
                }
                self.reply(SubscriptionResponse::ok(tx).into())?;
                let securities: Vec<SecurityId> = self
                    .behavior
                    .read()
                    .securities
                    .iter()
                    .filter(|s| lookup.security_id.as_ref().map_or(true, |want| want == *s))
                    .cloned()
                    .collect();
                for security_id in securities {
                    self.reply(
                        InstrumentData {
                            ids: SubscriptionIds::single(tx),
                            name: security_id.code.clone(),
                            security_id,
                        }
                        .into(),
                    )?;
                }
                self.reply(SubscriptionFinished { original_transaction_id: tx }.into())
            }
            Message::PortfolioLookup(lookup) => {
                let tx = lookup.header.transaction_id;
                if let Some(rejection) = self.rejection() {
                    return self.reply(SubscriptionResponse::error(tx, rejection).into());
                }
                self.reply(SubscriptionResponse::ok(tx).into())?;
                let portfolios: Vec<String> = self
                    .behavior
                    .read()
                    .portfolios
                    .iter()
                    .filter(|p| {
                        lookup
                            .portfolio
                            .as_ref()
                            .map_or(true, |want| want.eq_ignore_ascii_case(p))
                    })
                    .cloned()
                    .collect();
                for portfolio in portfolios {
                    self.reply(
                        PortfolioData {
                            ids: SubscriptionIds::single(tx),
                            portfolio,
                            balance: Decimal::ZERO,
                        }
                        .into(),
                    )?;
                }
                self.reply(SubscriptionFinished { original_transaction_id: tx }.into())
            }
            Message::OrderStatus(request) => {
                let tx = request.header.transaction_id;
                if let Some(rejection) = self.rejection() {
                    return self.reply(SubscriptionResponse::error(tx, rejection).into());
                }
                self.reply(SubscriptionResponse::ok(tx).into())?;
                let reports: Vec<Message> = {
                    let state = self.state.lock();
                    state
                        .orders
                        .values()
                        .filter(|o| {
                            request
                                .portfolio
                                .as_ref()
                                .map_or(true, |p| p.eq_ignore_ascii_case(&o.portfolio))
                                && request
                                    .security_id
                                    .as_ref()
                                    .map_or(true, |s| *s == o.security_id)
                        })
                        .map(|o| {
                            let mut report = ExecutionData::order_reply(
                                tx,
                                o.security_id.clone(),
                                Some(o.portfolio.clone()),
                                None,
                            );
                            report.ids.subscription_ids = vec![tx];
                            report.order_state = Some(o.state);
                            report.into()
                        })
                        .collect()
                };
                for report in reports {
                    self.reply(report)?;
                }
                self.reply(SubscriptionFinished { original_transaction_id: tx }.into())
            }
            Message::MarketData(request) => {
                let tx = request.header.transaction_id;
                if !request.header.is_subscribe {
                    if let Some(original) = request.header.original_transaction_id {
                        self.state.lock().subscriptions.remove(&original);
                    }
                    return self.reply(SubscriptionResponse::ok(tx).into());
                }
                if self.behavior.read().decline.contains(&request.data_kind) {
                    return self.reply(
                        SubscriptionResponse::error(
                            tx,
                            ReplyError::not_supported(format!(
                                "{} does not serve {}",
                                self.name, request.data_kind
                            )),
                        )
                        .into(),
                    );
                }
                if let Some(rejection) = self.rejection() {
                    return self.reply(SubscriptionResponse::error(tx, rejection).into());
                }
                self.state.lock().subscriptions.insert(
                    tx,
                    ActiveSubscription {
                        data_kind: request.data_kind,
                        security_id: request.security_id.clone(),
                    },
                );
                self.reply(SubscriptionResponse::ok(tx).into())?;
                self.reply(SubscriptionOnline { original_transaction_id: tx }.into())
            }
            Message::OrderRegister(order) => {
                self.state.lock().orders.insert(
                    order.transaction_id,
                    SimOrder {
                        security_id: order.security_id.clone(),
                        portfolio: order.portfolio.clone(),
                        state: OrderState::Active,
                    },
                );
                let mut report = ExecutionData::order_reply(
                    order.transaction_id,
                    order.security_id.clone(),
                    Some(order.portfolio.clone()),
                    None,
                );
                report.price = Some(order.price);
                report.volume = Some(order.volume);
                self.reply(report.into())
            }
            Message::OrderCancel(cancel) => {
                let known = {
                    let mut state = self.state.lock();
                    match state.orders.get_mut(&cancel.original_transaction_id) {
                        Some(order) => {
                            order.state = OrderState::Done;
                            true
                        }
                        None => false,
                    }
                };
                let error = (!known).then(|| ReplyError::rejected("unknown order"));
                let mut report = ExecutionData::order_reply(
                    cancel.transaction_id,
                    cancel.security_id.clone(),
                    Some(cancel.portfolio.clone()),
                    error,
                );
                if known {
                    report.order_state = Some(OrderState::Done);
                }
                self.reply(report.into())
            }
            Message::OrderReplace(replace) => {
                let known = {
                    let mut state = self.state.lock();
                    match state.orders.remove(&replace.original_transaction_id) {
                        Some(mut order) => {
                            order.state = OrderState::Active;
                            state.orders.insert(replace.transaction_id, order);
                            true
                        }
                        None => false,
                    }
                };
                let error = (!known).then(|| ReplyError::rejected("unknown order"));
                let mut report = ExecutionData::order_reply(
                    replace.transaction_id,
                    replace.security_id.clone(),
                    Some(replace.portfolio.clone()),
                    error,
                );
                report.price = Some(replace.price);
                report.volume = Some(replace.volume);
                self.reply(report.into())
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
            | Message::Error(_) => {
                warn!(adapter = %self.name, kind = %message.kind(), "Ignoring reply sent inward");
                Ok(())
            }
        }
    }

    fn rejection(&self) -> Option<ReplyError> {
        self.behavior
            .read()
            .reject_with
            .as_ref()
            .map(|reason| ReplyError::rejected(reason.clone()))
    }
}

fn market_data_message(tx: TransactionId, sub: &ActiveSubscription, price: Decimal) -> Message {
    let ids = SubscriptionIds::single(tx);
    let security_id = sub
        .security_id
        .clone()
        .unwrap_or_else(|| SecurityId::new("ANY", "SIM"));
    let server_time = Utc::now();
    match sub.data_kind {
        DataKind::MarketDepth => QuoteData {
            ids,
            security_id,
            bids: vec![QuoteLevel {
                price,
                volume: Decimal::ONE,
            }],
            asks: vec![QuoteLevel {
                price: price + Decimal::ONE,
                volume: Decimal::ONE,
            }],
            server_time,
        }
        .into(),
        DataKind::Level1 => Level1Data {
            ids,
            security_id,
            last_price: Some(price),
            best_bid: Some(price),
            best_ask: Some(price + Decimal::ONE),
            server_time,
        }
        .into(),
        DataKind::Candles => CandleData {
            ids,
            security_id,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            server_time,
        }
        .into(),
        DataKind::News => NewsData {
            ids,
            security_id: sub.security_id.clone(),
            headline: format!("price moved to {price}"),
            server_time,
        }
        .into(),
        DataKind::OrderLog | DataKind::Ticks | DataKind::Board => {
            let kind = if sub.data_kind == DataKind::OrderLog {
                ExecutionKind::OrderLog
            } else {
                ExecutionKind::Tick
            };
            ExecutionData {
                ids,
                kind,
                security_id,
                portfolio: None,
                order_state: None,
                price: Some(price),
                volume: Some(Decimal::ONE),
                latency_us: None,
                error: None,
                server_time,
            }
            .into()
        }
        DataKind::Securities => InstrumentData {
            ids,
            name: security_id.code.clone(),
            security_id,
        }
        .into(),
        DataKind::PositionChanges | DataKind::Transactions => PortfolioData {
            ids,
            portfolio: "sim".to_string(),
            balance: price,
        }
        .into(),
    }
}

impl MessageAdapter for SimAdapter {
    fn id(&self) -> AdapterId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    fn send_in(&self, message: Message) -> AdapterResult<()> {
        debug!(adapter = %self.name, kind = %message.kind(), "Sim received");
        self.state.lock().received.push(message.clone());
        self.handle(&message)
    }

    fn bind(&self, out: mpsc::UnboundedSender<Message>) {
        *self.out.write() = Some(out);
    }

    fn clone_adapter(&self) -> Arc<dyn MessageAdapter> {
        Arc::new(Self::with_behavior(
            self.name.clone(),
            self.capabilities(),
            self.behavior.read().clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::{InstrumentLookup, MarketDataRequest, OrderCancel, OrderRegister, OrderSide};
    use rust_decimal_macros::dec;

    fn bound(sim: &SimAdapter) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        sim.bind(tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_unbound_send_fails() {
        let sim = SimAdapter::new("sim", Capabilities::new());
        assert!(matches!(
            sim.send_in(Message::Connect(ConnectMessage::default())),
            Err(AdapterError::NotBound(_))
        ));
    }

    #[test]
    fn test_connect_failure() {
        let sim = SimAdapter::with_behavior(
            "sim",
            Capabilities::new(),
            SimBehavior {
                fail_connect: true,
                ..Default::default()
            },
        );
        let mut rx = bound(&sim);
        sim.send_in(Message::Connect(ConnectMessage::default())).unwrap();
        let replies = drain(&mut rx);
        assert!(matches!(&replies[..], [Message::Connect(c)] if c.error.is_some()));
        assert!(!sim.is_connected());
    }

    #[test]
    fn test_instrument_lookup_filters_catalog() {
        let aapl = SecurityId::new("AAPL", "NASDAQ");
        let sim = SimAdapter::with_behavior(
            "sim",
            Capabilities::new(),
            SimBehavior {
                securities: vec![aapl.clone(), SecurityId::new("MSFT", "NASDAQ")],
                ..Default::default()
            },
        );
        let mut rx = bound(&sim);
        sim.send_in(InstrumentLookup::new(TransactionId::new(4), Some(aapl)).into())
            .unwrap();

        let kinds: Vec<_> = drain(&mut rx).iter().map(Message::kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::SubscriptionResponse,
                MessageKind::Instrument,
                MessageKind::SubscriptionFinished
            ]
        );
    }

    #[test]
    fn test_declined_kind_answers_not_supported() {
        let mut behavior = SimBehavior::default();
        behavior.decline.insert(DataKind::Ticks);
        let sim = SimAdapter::with_behavior(
            "sim",
            Capabilities::new().with_market_data(DataKind::Ticks),
            behavior,
        );
        let mut rx = bound(&sim);
        sim.send_in(MarketDataRequest::subscribe(TransactionId::new(1), DataKind::Ticks, None).into())
            .unwrap();

        match drain(&mut rx).as_slice() {
            [Message::SubscriptionResponse(r)] => {
                assert!(r.error.as_ref().unwrap().is_not_supported())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sim.active_subscriptions().is_empty());
    }

    #[test]
    fn test_publish_and_unsubscribe() {
        let sim = SimAdapter::new("sim", Capabilities::new().with_market_data(DataKind::Level1));
        let mut rx = bound(&sim);
        sim.send_in(MarketDataRequest::subscribe(TransactionId::new(1), DataKind::Level1, None).into())
            .unwrap();
        drain(&mut rx);

        assert_eq!(sim.publish_market_data(dec!(5)).unwrap(), 1);
        assert!(matches!(drain(&mut rx).as_slice(), [Message::Level1(_)]));

        sim.send_in(
            MarketDataRequest::unsubscribe(
                TransactionId::new(2),
                TransactionId::new(1),
                DataKind::Level1,
                None,
            )
            .into(),
        )
        .unwrap();
        assert_eq!(sim.publish_market_data(dec!(6)).unwrap(), 0);
    }

    #[test]
    fn test_cancel_unknown_order_rejected() {
        let sim = SimAdapter::new("sim", Capabilities::trading());
        let mut rx = bound(&sim);
        let security = SecurityId::new("AAPL", "NASDAQ");
        sim.send_in(
            OrderRegister {
                transaction_id: TransactionId::new(1),
                security_id: security.clone(),
                portfolio: "acc".into(),
                side: OrderSide::Buy,
                price: dec!(1),
                volume: dec!(1),
                adapter: None,
            }
            .into(),
        )
        .unwrap();
        sim.send_in(
            OrderCancel {
                transaction_id: TransactionId::new(2),
                original_transaction_id: TransactionId::new(99),
                security_id: security,
                portfolio: "acc".into(),
            }
            .into(),
        )
        .unwrap();

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 2);
        assert!(replies[0].reply_error().is_none());
        assert!(replies[1].reply_error().is_some());
    }

    #[test]
    fn test_silent_records_without_answer() {
        let sim = SimAdapter::with_behavior(
            "sim",
            Capabilities::new(),
            SimBehavior {
                silent: true,
                ..Default::default()
            },
        );
        let mut rx = bound(&sim);
        sim.send_in(InstrumentLookup::new(TransactionId::new(1), None).into())
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(sim.received_of(MessageKind::InstrumentLookup).len(), 1);
    }
}
