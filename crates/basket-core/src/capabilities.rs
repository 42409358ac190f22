//! Capability descriptor of a backend connection.

use crate::kinds::{DataKind, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a backend connection declares it can serve.
///
/// Connection-control kinds (connect, disconnect, reset, time) are always
/// supported and need not be listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Supported request kinds.
    #[serde(default)]
    pub message_kinds: HashSet<MessageKind>,
    /// Supported market-data kinds.
    #[serde(default)]
    pub market_data_kinds: HashSet<DataKind>,
    /// Data kinds for which a lookup without criteria ("download all") is served.
    #[serde(default)]
    pub bulk_download: HashSet<DataKind>,
    /// News is only served for a specific security.
    #[serde(default)]
    pub security_news_only: bool,
}

impl Capabilities {
    /// Empty descriptor (control messages only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a supported request kind.
    pub fn with_message_kind(mut self, kind: MessageKind) -> Self {
        self.message_kinds.insert(kind);
        self
    }

    /// Add a supported market-data kind (implies market-data requests).
    pub fn with_market_data(mut self, kind: DataKind) -> Self {
        self.message_kinds.insert(MessageKind::MarketData);
        self.market_data_kinds.insert(kind);
        self
    }

    /// Add bulk-download support for a data kind.
    pub fn with_bulk_download(mut self, kind: DataKind) -> Self {
        self.bulk_download.insert(kind);
        self
    }

    /// Mark news as security-scoped only.
    pub fn with_security_news_only(mut self) -> Self {
        self.security_news_only = true;
        self
    }

    /// Typical trading backend: orders, order status and portfolios.
    pub fn trading() -> Self {
        Self::new()
            .with_message_kind(MessageKind::OrderRegister)
            .with_message_kind(MessageKind::OrderCancel)
            .with_message_kind(MessageKind::OrderReplace)
            .with_message_kind(MessageKind::OrderStatus)
            .with_message_kind(MessageKind::PortfolioLookup)
    }

    pub fn supports_message_kind(&self, kind: MessageKind) -> bool {
        kind.is_control() || self.message_kinds.contains(&kind)
    }

    pub fn supports_market_data_kind(&self, kind: DataKind) -> bool {
        self.supports_message_kind(MessageKind::MarketData)
            && self.market_data_kinds.contains(&kind)
    }

    pub fn supports_bulk_download(&self, kind: DataKind) -> bool {
        self.bulk_download.contains(&kind)
    }

    /// Native kind, or the first kind this backend can build `kind` from.
    pub fn market_data_source(&self, kind: DataKind) -> Option<DataKind> {
        if self.supports_market_data_kind(kind) {
            return Some(kind);
        }
        kind.derivable_from()
            .iter()
            .copied()
            .find(|source| self.supports_market_data_kind(*source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_always_supported() {
        let caps = Capabilities::new();
        assert!(caps.supports_message_kind(MessageKind::Connect));
        assert!(caps.supports_message_kind(MessageKind::Reset));
        assert!(!caps.supports_message_kind(MessageKind::InstrumentLookup));
    }

    #[test]
    fn test_market_data_requires_kind() {
        let caps = Capabilities::new().with_market_data(DataKind::Ticks);
        assert!(caps.supports_market_data_kind(DataKind::Ticks));
        assert!(!caps.supports_market_data_kind(DataKind::Level1));
    }

    #[test]
    fn test_market_data_source_derivation() {
        let caps = Capabilities::new().with_market_data(DataKind::OrderLog);
        assert_eq!(
            caps.market_data_source(DataKind::MarketDepth),
            Some(DataKind::OrderLog)
        );
        assert_eq!(
            caps.market_data_source(DataKind::Ticks),
            Some(DataKind::OrderLog)
        );
        assert_eq!(caps.market_data_source(DataKind::Candles), None);
    }

    #[test]
    fn test_bulk_download() {
        let caps = Capabilities::new()
            .with_message_kind(MessageKind::InstrumentLookup)
            .with_bulk_download(DataKind::Securities);
        assert!(caps.supports_bulk_download(DataKind::Securities));
        assert!(!caps.supports_bulk_download(DataKind::PositionChanges));
    }
}
