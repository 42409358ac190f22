//! The message union exchanged between caller, router and backends.
//!
//! Requests carry a `transaction_id`; replies carry the id of the request
//! they answer in `original_transaction_id`. Data payloads additionally
//! carry the set of subscription ids they satisfy, so one tick can serve
//! several subscriptions at once.

use crate::ids::{AdapterId, TransactionId};
use crate::kinds::{DataKind, MessageKind};
use crate::order::{OrderSide, OrderState};
use crate::reply_error::ReplyError;
use crate::security::SecurityId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Common header of subscription-style requests (lookups and market data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub transaction_id: TransactionId,
    /// For an unsubscribe: the subscription being torn down.
    #[serde(default)]
    pub original_transaction_id: Option<TransactionId>,
    pub is_subscribe: bool,
    /// Route straight to this backend, bypassing capability selection.
    #[serde(default)]
    pub adapter: Option<AdapterId>,
}

impl RequestHeader {
    pub fn subscribe(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            original_transaction_id: None,
            is_subscribe: true,
            adapter: None,
        }
    }

    pub fn unsubscribe(transaction_id: TransactionId, original: TransactionId) -> Self {
        Self {
            transaction_id,
            original_transaction_id: Some(original),
            is_subscribe: false,
            adapter: None,
        }
    }
}

/// Connect request, or a backend's connect outcome when sent outward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMessage {
    #[serde(default)]
    pub error: Option<ReplyError>,
}

/// Disconnect request, or a backend's disconnect notice when sent outward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMessage {
    #[serde(default)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetMessage {
    pub transaction_id: TransactionId,
}

/// Liveness check. Sent inward as a ping, echoed outward as a pong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMessage {
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub original_transaction_id: Option<TransactionId>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentLookup {
    pub header: RequestHeader,
    /// `None` asks for the whole catalog.
    #[serde(default)]
    pub security_id: Option<SecurityId>,
}

impl InstrumentLookup {
    pub fn new(transaction_id: TransactionId, security_id: Option<SecurityId>) -> Self {
        Self {
            header: RequestHeader::subscribe(transaction_id),
            security_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioLookup {
    pub header: RequestHeader,
    /// `None` asks for every portfolio.
    #[serde(default)]
    pub portfolio: Option<String>,
}

impl PortfolioLookup {
    pub fn new(transaction_id: TransactionId, portfolio: Option<String>) -> Self {
        Self {
            header: RequestHeader::subscribe(transaction_id),
            portfolio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusRequest {
    pub header: RequestHeader,
    #[serde(default)]
    pub portfolio: Option<String>,
    #[serde(default)]
    pub security_id: Option<SecurityId>,
}

impl OrderStatusRequest {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            header: RequestHeader::subscribe(transaction_id),
            portfolio: None,
            security_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataRequest {
    pub header: RequestHeader,
    pub data_kind: DataKind,
    #[serde(default)]
    pub security_id: Option<SecurityId>,
    /// Set by the router when the backend builds `data_kind` from another kind.
    #[serde(default)]
    pub build_from: Option<DataKind>,
}

impl MarketDataRequest {
    pub fn subscribe(
        transaction_id: TransactionId,
        data_kind: DataKind,
        security_id: Option<SecurityId>,
    ) -> Self {
        Self {
            header: RequestHeader::subscribe(transaction_id),
            data_kind,
            security_id,
            build_from: None,
        }
    }

    pub fn unsubscribe(
        transaction_id: TransactionId,
        original: TransactionId,
        data_kind: DataKind,
        security_id: Option<SecurityId>,
    ) -> Self {
        Self {
            header: RequestHeader::unsubscribe(transaction_id, original),
            data_kind,
            security_id,
            build_from: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRegister {
    pub transaction_id: TransactionId,
    pub security_id: SecurityId,
    pub portfolio: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub adapter: Option<AdapterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancel {
    pub transaction_id: TransactionId,
    /// The registration being canceled.
    pub original_transaction_id: TransactionId,
    pub security_id: SecurityId,
    pub portfolio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReplace {
    pub transaction_id: TransactionId,
    /// The registration being replaced.
    pub original_transaction_id: TransactionId,
    pub security_id: SecurityId,
    pub portfolio: String,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub original_transaction_id: TransactionId,
    #[serde(default)]
    pub error: Option<ReplyError>,
}

impl SubscriptionResponse {
    pub fn ok(original_transaction_id: TransactionId) -> Self {
        Self {
            original_transaction_id,
            error: None,
        }
    }

    pub fn error(original_transaction_id: TransactionId, error: ReplyError) -> Self {
        Self {
            original_transaction_id,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOnline {
    pub original_transaction_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFinished {
    pub original_transaction_id: TransactionId,
}

/// Subscriptions a data payload satisfies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIds {
    #[serde(default)]
    pub original_transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub subscription_ids: Vec<TransactionId>,
}

impl SubscriptionIds {
    /// Payload answering exactly one subscription.
    pub fn single(id: TransactionId) -> Self {
        Self {
            original_transaction_id: Some(id),
            subscription_ids: vec![id],
        }
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.original_transaction_id == Some(id) || self.subscription_ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.original_transaction_id.is_none() && self.subscription_ids.is_empty()
    }

    /// Every id the payload carries, original first. May repeat.
    pub fn iter(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.original_transaction_id
            .into_iter()
            .chain(self.subscription_ids.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentData {
    pub ids: SubscriptionIds,
    pub security_id: SecurityId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioData {
    pub ids: SubscriptionIds,
    pub portfolio: String,
    #[serde(default)]
    pub balance: Decimal,
}

/// What an execution report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Public trade.
    Tick,
    /// Order-book event.
    OrderLog,
    /// Own order or trade.
    Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionData {
    pub ids: SubscriptionIds,
    pub kind: ExecutionKind,
    pub security_id: SecurityId,
    #[serde(default)]
    pub portfolio: Option<String>,
    #[serde(default)]
    pub order_state: Option<OrderState>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    /// Order round-trip latency, filled by the latency stage.
    #[serde(default)]
    pub latency_us: Option<u64>,
    #[serde(default)]
    pub error: Option<ReplyError>,
    pub server_time: DateTime<Utc>,
}

impl ExecutionData {
    /// Transaction report for an order request, optionally failed.
    pub fn order_reply(
        original_transaction_id: TransactionId,
        security_id: SecurityId,
        portfolio: Option<String>,
        error: Option<ReplyError>,
    ) -> Self {
        let order_state = if error.is_some() {
            OrderState::Failed
        } else {
            OrderState::Active
        };
        Self {
            ids: SubscriptionIds {
                original_transaction_id: Some(original_transaction_id),
                subscription_ids: Vec::new(),
            },
            kind: ExecutionKind::Transaction,
            security_id,
            portfolio,
            order_state: Some(order_state),
            price: None,
            volume: None,
            latency_us: None,
            error,
            server_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteData {
    pub ids: SubscriptionIds,
    pub security_id: SecurityId,
    #[serde(default)]
    pub bids: Vec<QuoteLevel>,
    #[serde(default)]
    pub asks: Vec<QuoteLevel>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level1Data {
    pub ids: SubscriptionIds,
    pub security_id: SecurityId,
    #[serde(default)]
    pub last_price: Option<Decimal>,
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    #[serde(default)]
    pub best_ask: Option<Decimal>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleData {
    pub ids: SubscriptionIds,
    pub security_id: SecurityId,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsData {
    pub ids: SubscriptionIds,
    #[serde(default)]
    pub security_id: Option<SecurityId>,
    pub headline: String,
    pub server_time: DateTime<Utc>,
}

/// Free-standing error not tied to a subscription reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub original_transaction_id: Option<TransactionId>,
    pub error: ReplyError,
}

/// Every message the router handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Connect(ConnectMessage),
    Disconnect(DisconnectMessage),
    Reset(ResetMessage),
    Time(TimeMessage),
    InstrumentLookup(InstrumentLookup),
    PortfolioLookup(PortfolioLookup),
    OrderStatus(OrderStatusRequest),
    MarketData(MarketDataRequest),
    OrderRegister(OrderRegister),
    OrderCancel(OrderCancel),
    OrderReplace(OrderReplace),
    SubscriptionResponse(SubscriptionResponse),
    SubscriptionOnline(SubscriptionOnline),
    SubscriptionFinished(SubscriptionFinished),
    Instrument(InstrumentData),
    Portfolio(PortfolioData),
    Execution(ExecutionData),
    Quote(QuoteData),
    Level1(Level1Data),
    Candle(CandleData),
    News(NewsData),
    Error(ErrorMessage),
}

macro_rules! impl_from_payload {
    ($($payload:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for Message {
                fn from(payload: $payload) -> Self {
                    Message::$variant(payload)
                }
            }
        )*
    };
}

impl_from_payload! {
    ConnectMessage => Connect,
    DisconnectMessage => Disconnect,
    ResetMessage => Reset,
    TimeMessage => Time,
    InstrumentLookup => InstrumentLookup,
    PortfolioLookup => PortfolioLookup,
    OrderStatusRequest => OrderStatus,
    MarketDataRequest => MarketData,
    OrderRegister => OrderRegister,
    OrderCancel => OrderCancel,
    OrderReplace => OrderReplace,
    SubscriptionResponse => SubscriptionResponse,
    SubscriptionOnline => SubscriptionOnline,
    SubscriptionFinished => SubscriptionFinished,
    InstrumentData => Instrument,
    PortfolioData => Portfolio,
    ExecutionData => Execution,
    QuoteData => Quote,
    Level1Data => Level1,
    CandleData => Candle,
    NewsData => News,
    ErrorMessage => Error,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connect(_) => MessageKind::Connect,
            Self::Disconnect(_) => MessageKind::Disconnect,
            Self::Reset(_) => MessageKind::Reset,
            Self::Time(_) => MessageKind::Time,
            Self::InstrumentLookup(_) => MessageKind::InstrumentLookup,
            Self::PortfolioLookup(_) => MessageKind::PortfolioLookup,
            Self::OrderStatus(_) => MessageKind::OrderStatus,
            Self::MarketData(_) => MessageKind::MarketData,
            Self::OrderRegister(_) => MessageKind::OrderRegister,
            Self::OrderCancel(_) => MessageKind::OrderCancel,
            Self::OrderReplace(_) => MessageKind::OrderReplace,
            Self::SubscriptionResponse(_) => MessageKind::SubscriptionResponse,
            Self::SubscriptionOnline(_) => MessageKind::SubscriptionOnline,
            Self::SubscriptionFinished(_) => MessageKind::SubscriptionFinished,
            Self::Instrument(_) => MessageKind::Instrument,
            Self::Portfolio(_) => MessageKind::Portfolio,
            Self::Execution(_) => MessageKind::Execution,
            Self::Quote(_) => MessageKind::Quote,
            Self::Level1(_) => MessageKind::Level1,
            Self::Candle(_) => MessageKind::Candle,
            Self::News(_) => MessageKind::News,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Header of lookup and market-data requests.
    pub fn header(&self) -> Option<&RequestHeader> {
        match self {
            Self::InstrumentLookup(m) => Some(&m.header),
            Self::PortfolioLookup(m) => Some(&m.header),
            Self::OrderStatus(m) => Some(&m.header),
            Self::MarketData(m) => Some(&m.header),
            _ => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut RequestHeader> {
        match self {
            Self::InstrumentLookup(m) => Some(&mut m.header),
            Self::PortfolioLookup(m) => Some(&mut m.header),
            Self::OrderStatus(m) => Some(&mut m.header),
            Self::MarketData(m) => Some(&mut m.header),
            _ => None,
        }
    }

    /// Id of a request.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::Reset(m) => Some(m.transaction_id),
            Self::Time(m) => m.transaction_id,
            Self::OrderRegister(m) => Some(m.transaction_id),
            Self::OrderCancel(m) => Some(m.transaction_id),
            Self::OrderReplace(m) => Some(m.transaction_id),
            other => other.header().map(|h| h.transaction_id),
        }
    }

    /// Id of the request a reply answers, or the target of an unsubscribe/cancel.
    pub fn original_transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::Time(m) => m.original_transaction_id,
            Self::OrderCancel(m) => Some(m.original_transaction_id),
            Self::OrderReplace(m) => Some(m.original_transaction_id),
            Self::SubscriptionResponse(m) => Some(m.original_transaction_id),
            Self::SubscriptionOnline(m) => Some(m.original_transaction_id),
            Self::SubscriptionFinished(m) => Some(m.original_transaction_id),
            Self::Error(m) => m.original_transaction_id,
            other => match other.subscription_ids() {
                Some(ids) => ids.original_transaction_id,
                None => other.header().and_then(|h| h.original_transaction_id),
            },
        }
    }

    /// Subscribe flag of lookup and market-data requests; `true` otherwise.
    pub fn is_subscribe(&self) -> bool {
        self.header().map_or(true, |h| h.is_subscribe)
    }

    /// Backend the caller asked for explicitly.
    pub fn explicit_adapter(&self) -> Option<AdapterId> {
        match self {
            Self::OrderRegister(m) => m.adapter,
            other => other.header().and_then(|h| h.adapter),
        }
    }

    /// Data kind a request asks for, or a payload carries.
    pub fn data_kind(&self) -> Option<DataKind> {
        match self {
            Self::InstrumentLookup(_) | Self::Instrument(_) => Some(DataKind::Securities),
            Self::PortfolioLookup(_) | Self::Portfolio(_) => Some(DataKind::PositionChanges),
            Self::OrderStatus(_) => Some(DataKind::Transactions),
            Self::MarketData(m) => Some(m.data_kind),
            Self::Execution(m) => Some(match m.kind {
                ExecutionKind::Tick => DataKind::Ticks,
                ExecutionKind::OrderLog => DataKind::OrderLog,
                ExecutionKind::Transaction => DataKind::Transactions,
            }),
            Self::Quote(_) => Some(DataKind::MarketDepth),
            Self::Level1(_) => Some(DataKind::Level1),
            Self::Candle(_) => Some(DataKind::Candles),
            Self::News(_) => Some(DataKind::News),
            _ => None,
        }
    }

    /// A lookup with no entity criterion ("download all").
    pub fn is_bulk_request(&self) -> bool {
        match self {
            Self::InstrumentLookup(m) => m.security_id.is_none(),
            Self::PortfolioLookup(m) => m.portfolio.is_none(),
            Self::OrderStatus(m) => m.portfolio.is_none() && m.security_id.is_none(),
            _ => false,
        }
    }

    pub fn security_id(&self) -> Option<&SecurityId> {
        match self {
            Self::InstrumentLookup(m) => m.security_id.as_ref(),
            Self::OrderStatus(m) => m.security_id.as_ref(),
            Self::MarketData(m) => m.security_id.as_ref(),
            Self::OrderRegister(m) => Some(&m.security_id),
            Self::OrderCancel(m) => Some(&m.security_id),
            Self::OrderReplace(m) => Some(&m.security_id),
            Self::Instrument(m) => Some(&m.security_id),
            Self::Execution(m) => Some(&m.security_id),
            Self::Quote(m) => Some(&m.security_id),
            Self::Level1(m) => Some(&m.security_id),
            Self::Candle(m) => Some(&m.security_id),
            Self::News(m) => m.security_id.as_ref(),
            _ => None,
        }
    }

    pub fn portfolio(&self) -> Option<&str> {
        match self {
            Self::PortfolioLookup(m) => m.portfolio.as_deref(),
            Self::OrderStatus(m) => m.portfolio.as_deref(),
            Self::OrderRegister(m) => Some(&m.portfolio),
            Self::OrderCancel(m) => Some(&m.portfolio),
            Self::OrderReplace(m) => Some(&m.portfolio),
            Self::Portfolio(m) => Some(&m.portfolio),
            Self::Execution(m) => m.portfolio.as_deref(),
            _ => None,
        }
    }

    pub fn subscription_ids(&self) -> Option<&SubscriptionIds> {
        match self {
            Self::Instrument(m) => Some(&m.ids),
            Self::Portfolio(m) => Some(&m.ids),
            Self::Execution(m) => Some(&m.ids),
            Self::Quote(m) => Some(&m.ids),
            Self::Level1(m) => Some(&m.ids),
            Self::Candle(m) => Some(&m.ids),
            Self::News(m) => Some(&m.ids),
            _ => None,
        }
    }

    pub fn subscription_ids_mut(&mut self) -> Option<&mut SubscriptionIds> {
        match self {
            Self::Instrument(m) => Some(&mut m.ids),
            Self::Portfolio(m) => Some(&mut m.ids),
            Self::Execution(m) => Some(&mut m.ids),
            Self::Quote(m) => Some(&mut m.ids),
            Self::Level1(m) => Some(&mut m.ids),
            Self::Candle(m) => Some(&mut m.ids),
            Self::News(m) => Some(&mut m.ids),
            _ => None,
        }
    }

    /// Copy of a lookup or market-data request under a new id.
    ///
    /// Returns `None` for any other kind.
    pub fn to_child(
        &self,
        child_id: TransactionId,
        original: Option<TransactionId>,
        build_from: Option<DataKind>,
    ) -> Option<Message> {
        let mut child = self.clone();
        let header = child.header_mut()?;
        header.transaction_id = child_id;
        header.original_transaction_id = original;
        header.adapter = None;
        if let Message::MarketData(m) = &mut child {
            m.build_from = build_from;
        }
        Some(child)
    }

    /// Reply the caller expects when this request fails.
    ///
    /// Returns `None` for messages that are not answered.
    pub fn error_reply(&self, error: ReplyError) -> Option<Message> {
        match self {
            Self::Connect(_) => Some(Message::Connect(ConnectMessage { error: Some(error) })),
            Self::Disconnect(_) => Some(Message::Disconnect(DisconnectMessage {
                error: Some(error),
            })),
            Self::InstrumentLookup(_)
            | Self::PortfolioLookup(_)
            | Self::OrderStatus(_)
            | Self::MarketData(_) => {
                let tx = self.transaction_id()?;
                Some(SubscriptionResponse::error(tx, error).into())
            }
            Self::OrderRegister(m) => Some(
                ExecutionData::order_reply(
                    m.transaction_id,
                    m.security_id.clone(),
                    Some(m.portfolio.clone()),
                    Some(error),
                )
                .into(),
            ),
            Self::OrderCancel(m) => Some(
                ExecutionData::order_reply(
                    m.transaction_id,
                    m.security_id.clone(),
                    Some(m.portfolio.clone()),
                    Some(error),
                )
                .into(),
            ),
            Self::OrderReplace(m) => Some(
                ExecutionData::order_reply(
                    m.transaction_id,
                    m.security_id.clone(),
                    Some(m.portfolio.clone()),
                    Some(error),
                )
                .into(),
            ),
            Self::Reset(_) | Self::Time(_) => None,
            Self::SubscriptionResponse(_)
            | Self::SubscriptionOnline(_)
            | Self::SubscriptionFinished(_)
            | Self::Instrument(_)
            | Self::Portfolio(_)
            | Self::Execution(_)
            | Self::Quote(_)
            | Self::Level1(_)
            | Self::Candle(_)
            | Self::News(_)
            | Self::Error(_) => None,
        }
    }

    /// Error carried by a reply, if any.
    pub fn reply_error(&self) -> Option<&ReplyError> {
        match self {
            Self::Connect(m) => m.error.as_ref(),
            Self::Disconnect(m) => m.error.as_ref(),
            Self::SubscriptionResponse(m) => m.error.as_ref(),
            Self::Execution(m) => m.error.as_ref(),
            Self::Error(m) => Some(&m.error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn aapl() -> SecurityId {
        SecurityId::new("AAPL", "NASDAQ")
    }

    #[test]
    fn test_bulk_request_detection() {
        let all = Message::from(InstrumentLookup::new(TransactionId::new(1), None));
        let one = Message::from(InstrumentLookup::new(TransactionId::new(2), Some(aapl())));
        assert!(all.is_bulk_request());
        assert!(!one.is_bulk_request());

        let mut status = OrderStatusRequest::new(TransactionId::new(3));
        assert!(Message::from(status.clone()).is_bulk_request());
        status.portfolio = Some("acc-1".into());
        assert!(!Message::from(status).is_bulk_request());
    }

    #[test]
    fn test_to_child_rewrites_header() {
        let mut request =
            MarketDataRequest::subscribe(TransactionId::new(10), DataKind::MarketDepth, Some(aapl()));
        request.header.adapter = Some(AdapterId::new());
        let parent = Message::from(request);

        let child = parent
            .to_child(TransactionId::new(11), None, Some(DataKind::OrderLog))
            .unwrap();
        assert_eq!(child.transaction_id(), Some(TransactionId::new(11)));
        assert_eq!(child.explicit_adapter(), None);
        match child {
            Message::MarketData(m) => assert_eq!(m.build_from, Some(DataKind::OrderLog)),
            other => panic!("unexpected {other:?}"),
        }
        // Parent untouched.
        assert_eq!(parent.transaction_id(), Some(TransactionId::new(10)));
    }

    #[test]
    fn test_to_child_rejects_orders() {
        let order = Message::from(OrderRegister {
            transaction_id: TransactionId::new(1),
            security_id: aapl(),
            portfolio: "acc-1".into(),
            side: OrderSide::Buy,
            price: dec!(100),
            volume: dec!(1),
            adapter: None,
        });
        assert!(order.to_child(TransactionId::new(2), None, None).is_none());
    }

    #[test]
    fn test_error_reply_shapes() {
        let lookup = Message::from(PortfolioLookup::new(TransactionId::new(5), None));
        match lookup.error_reply(ReplyError::routing_miss("none")).unwrap() {
            Message::SubscriptionResponse(r) => {
                assert_eq!(r.original_transaction_id, TransactionId::new(5));
                assert!(!r.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }

        let cancel = Message::from(OrderCancel {
            transaction_id: TransactionId::new(7),
            original_transaction_id: TransactionId::new(6),
            security_id: aapl(),
            portfolio: "acc-1".into(),
        });
        match cancel.error_reply(ReplyError::routing_miss("unknown order")).unwrap() {
            Message::Execution(e) => {
                assert_eq!(e.ids.original_transaction_id, Some(TransactionId::new(7)));
                assert_eq!(e.order_state, Some(OrderState::Failed));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_original_transaction_id_of_data() {
        let tick = Message::from(ExecutionData {
            ids: SubscriptionIds::single(TransactionId::new(9)),
            kind: ExecutionKind::Tick,
            security_id: aapl(),
            portfolio: None,
            order_state: None,
            price: Some(dec!(1)),
            volume: Some(dec!(1)),
            latency_us: None,
            error: None,
            server_time: Utc::now(),
        });
        assert_eq!(tick.original_transaction_id(), Some(TransactionId::new(9)));
        assert_eq!(tick.data_kind(), Some(DataKind::Ticks));
    }

    #[test]
    fn test_message_json_tagged() {
        let msg = Message::from(SubscriptionOnline {
            original_transaction_id: TransactionId::new(3),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "subscription_online");
        assert_eq!(json["original_transaction_id"], 3);
    }
}
