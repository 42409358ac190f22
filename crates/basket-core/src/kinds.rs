//! Message and market-data kinds.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discriminant of every [`crate::Message`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connect,
    Disconnect,
    Reset,
    Time,
    InstrumentLookup,
    PortfolioLookup,
    OrderStatus,
    MarketData,
    OrderRegister,
    OrderCancel,
    OrderReplace,
    SubscriptionResponse,
    SubscriptionOnline,
    SubscriptionFinished,
    Instrument,
    Portfolio,
    Execution,
    Quote,
    Level1,
    Candle,
    News,
    Error,
}

impl MessageKind {
    /// Connection-control kinds every backend handles.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Disconnect | Self::Reset | Self::Time
        )
    }

    /// Kinds the caller sends to request something.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::Disconnect
                | Self::Reset
                | Self::Time
                | Self::InstrumentLookup
                | Self::PortfolioLookup
                | Self::OrderStatus
                | Self::MarketData
                | Self::OrderRegister
                | Self::OrderCancel
                | Self::OrderReplace
        )
    }

    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reset => "reset",
            Self::Time => "time",
            Self::InstrumentLookup => "instrument_lookup",
            Self::PortfolioLookup => "portfolio_lookup",
            Self::OrderStatus => "order_status",
            Self::MarketData => "market_data",
            Self::OrderRegister => "order_register",
            Self::OrderCancel => "order_cancel",
            Self::OrderReplace => "order_replace",
            Self::SubscriptionResponse => "subscription_response",
            Self::SubscriptionOnline => "subscription_online",
            Self::SubscriptionFinished => "subscription_finished",
            Self::Instrument => "instrument",
            Self::Portfolio => "portfolio",
            Self::Execution => "execution",
            Self::Quote => "quote",
            Self::Level1 => "level1",
            Self::Candle => "candle",
            Self::News => "news",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a subscription of a given data kind is dispatched across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Sent once to every capable backend; outcomes are aggregated.
    FanOut,
    /// Sent to one backend at a time; a decline moves on to the next.
    Failover,
}

/// Kind of data a subscription or lookup produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Ticks,
    MarketDepth,
    Level1,
    News,
    Candles,
    OrderLog,
    Board,
    Securities,
    PositionChanges,
    Transactions,
}

impl DataKind {
    /// All kinds, in declaration order.
    pub const ALL: [DataKind; 10] = [
        Self::Ticks,
        Self::MarketDepth,
        Self::Level1,
        Self::News,
        Self::Candles,
        Self::OrderLog,
        Self::Board,
        Self::Securities,
        Self::PositionChanges,
        Self::Transactions,
    ];

    /// Dispatch policy for subscriptions of this kind.
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        match self {
            Self::Ticks
            | Self::MarketDepth
            | Self::Level1
            | Self::News
            | Self::Board
            | Self::Securities
            | Self::PositionChanges
            | Self::Transactions => DispatchPolicy::FanOut,
            Self::Candles | Self::OrderLog => DispatchPolicy::Failover,
        }
    }

    /// Kinds a backend may derive this kind from when it lacks native support.
    pub fn derivable_from(&self) -> &'static [DataKind] {
        match self {
            Self::MarketDepth => &[Self::OrderLog, Self::Level1],
            Self::Ticks => &[Self::OrderLog],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::MarketDepth => "market_depth",
            Self::Level1 => "level1",
            Self::News => "news",
            Self::Candles => "candles",
            Self::OrderLog => "order_log",
            Self::Board => "board",
            Self::Securities => "securities",
            Self::PositionChanges => "position_changes",
            Self::Transactions => "transactions",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownDataKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_policy_split() {
        for kind in [
            DataKind::Ticks,
            DataKind::MarketDepth,
            DataKind::Level1,
            DataKind::News,
        ] {
            assert_eq!(kind.dispatch_policy(), DispatchPolicy::FanOut);
        }
        assert_eq!(DataKind::Candles.dispatch_policy(), DispatchPolicy::Failover);
        assert_eq!(DataKind::OrderLog.dispatch_policy(), DispatchPolicy::Failover);
    }

    #[test]
    fn test_data_kind_parse() {
        assert_eq!("Market-Depth".parse::<DataKind>().unwrap(), DataKind::MarketDepth);
        assert_eq!("level1".parse::<DataKind>().unwrap(), DataKind::Level1);
        assert!("quotes".parse::<DataKind>().is_err());
    }

    #[test]
    fn test_depth_derivable_from_order_log() {
        assert!(DataKind::MarketDepth
            .derivable_from()
            .contains(&DataKind::OrderLog));
        assert!(DataKind::Candles.derivable_from().is_empty());
    }

    #[test]
    fn test_control_kinds() {
        assert!(MessageKind::Connect.is_control());
        assert!(!MessageKind::MarketData.is_control());
        assert!(MessageKind::OrderCancel.is_request());
        assert!(!MessageKind::Quote.is_request());
    }
}
