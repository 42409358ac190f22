//! Core domain types for the basket router.
//!
//! This crate provides the types shared by every layer of the router:
//! - `TransactionId`, `IdGenerator`: correlation identifiers
//! - `AdapterId`: identity of a backend connection
//! - `Message`: the closed union of requests and replies
//! - `Capabilities`: what a backend connection declares it can serve
//! - `ReplyError`: the error payload carried by reply messages

pub mod capabilities;
pub mod error;
pub mod ids;
pub mod kinds;
pub mod message;
pub mod order;
pub mod reply_error;
pub mod security;

pub use capabilities::Capabilities;
pub use error::{CoreError, Result};
pub use ids::{AdapterId, IdGenerator, TransactionId};
pub use kinds::{DataKind, DispatchPolicy, MessageKind};
pub use message::{
    CandleData, ConnectMessage, DisconnectMessage, ErrorMessage, ExecutionData, ExecutionKind,
    InstrumentData, InstrumentLookup, Level1Data, MarketDataRequest, Message, NewsData,
    OrderCancel, OrderRegister, OrderReplace, OrderStatusRequest, PortfolioData, PortfolioLookup,
    QuoteData, QuoteLevel, RequestHeader, ResetMessage, SubscriptionFinished, SubscriptionIds,
    SubscriptionOnline, SubscriptionResponse, TimeMessage,
};
pub use order::{OrderSide, OrderState};
pub use reply_error::{ReplyError, ReplyErrorKind};
pub use security::SecurityId;
