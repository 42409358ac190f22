//! Adapter router.
//!
//! Picks the backends a request goes to. Order of precedence:
//! 1. An explicitly requested backend.
//! 2. A portfolio pin, then a security pin.
//! 3. Every connected (or connecting) backend declaring the capability,
//!    in registration order, narrowed for "download all" lookups to
//!    backends with bulk-download support.
//!
//! Market-data requests additionally skip backends that already declined
//! the transaction.

use crate::connection_state::ConnectionStateTracker;
use crate::order_routing::OrderRoutingState;
use basket_adapter::MessageAdapter;
use basket_core::{AdapterId, DataKind, Message, MessageKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// One backend chosen for a request.
#[derive(Clone)]
pub struct Destination {
    pub adapter: Arc<dyn MessageAdapter>,
    /// Set when the backend builds the requested kind from another one.
    pub build_from: Option<DataKind>,
}

impl Destination {
    fn direct(adapter: Arc<dyn MessageAdapter>) -> Self {
        Self {
            adapter,
            build_from: None,
        }
    }

    /// Id of the chosen backend.
    pub fn id(&self) -> AdapterId {
        self.adapter.id()
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("adapter", &self.adapter.name())
            .field("build_from", &self.build_from)
            .finish()
    }
}

/// Selects destinations from live connection state and pins.
pub struct AdapterRouter {
    tracker: Arc<ConnectionStateTracker>,
    routes: Arc<OrderRoutingState>,
}

impl AdapterRouter {
    /// Router reading pins from `routes`. Holds no state of its own.
    pub fn new(tracker: Arc<ConnectionStateTracker>, routes: Arc<OrderRoutingState>) -> Self {
        Self { tracker, routes }
    }

    /// Destinations for `message`, in registration order.
    ///
    /// `not_supported` lists backends that declined this transaction; it
    /// only applies to market-data requests.
    pub fn select_destinations(
        &self,
        message: &Message,
        not_supported: &HashSet<AdapterId>,
    ) -> Vec<Destination> {
        if let Some(id) = message.explicit_adapter() {
            return match self.available(message, id, not_supported) {
                Some(adapter) => vec![Destination::direct(adapter)],
                None => {
                    debug!(adapter = %id, kind = %message.kind(), "Requested adapter unavailable");
                    Vec::new()
                }
            };
        }

        if let Some(pinned) = self.pinned(message, not_supported) {
            return pinned;
        }

        let kind = message.kind();
        let bulk_kind = if message.is_bulk_request() {
            message.data_kind()
        } else {
            None
        };

        let destinations: Vec<Destination> = self
            .tracker
            .routable_adapters()
            .into_iter()
            .filter(|adapter| {
                !(kind == MessageKind::MarketData && not_supported.contains(&adapter.id()))
            })
            .filter_map(|adapter| {
                let capabilities = adapter.capabilities();
                if !capabilities.supports_message_kind(kind) {
                    return None;
                }
                if let Some(data_kind) = bulk_kind {
                    if !capabilities.supports_bulk_download(data_kind) {
                        trace!(adapter = %adapter.name(), %data_kind, "No bulk download");
                        return None;
                    }
                }
                let mut build_from = None;
                if let Message::MarketData(request) = message {
                    let source = capabilities.market_data_source(request.data_kind)?;
                    if source != request.data_kind {
                        build_from = Some(source);
                    }
                    if request.data_kind == DataKind::News
                        && request.security_id.is_none()
                        && capabilities.security_news_only
                    {
                        return None;
                    }
                }
                Some(Destination {
                    adapter,
                    build_from,
                })
            })
            .collect();

        trace!(
            kind = %kind,
            destinations = ?destinations.iter().map(|d| d.adapter.name().to_string()).collect::<Vec<_>>(),
            "Selected destinations"
        );
        destinations
    }

    /// Destinations forced by a pin, if one applies.
    ///
    /// A pinned portfolio whose backend is unavailable yields no
    /// destination; a pinned security falls back to normal selection.
    fn pinned(
        &self,
        message: &Message,
        not_supported: &HashSet<AdapterId>,
    ) -> Option<Vec<Destination>> {
        if let Some(portfolio) = message.portfolio() {
            if let Some(id) = self.routes.portfolio_adapter(portfolio) {
                return Some(match self.available(message, id, not_supported) {
                    Some(adapter) => vec![Destination::direct(adapter)],
                    None => {
                        debug!(portfolio, adapter = %id, "Pinned portfolio adapter unavailable");
                        Vec::new()
                    }
                });
            }
        }

        let security = message.security_id()?;
        let id = self.routes.security_adapter(security, message.data_kind())?;
        match self.available(message, id, not_supported) {
            Some(adapter) => Some(vec![Destination::direct(adapter)]),
            None => {
                debug!(security = %security, adapter = %id, "Pinned security adapter unavailable, falling back");
                None
            }
        }
    }

    /// Routable adapter that has not declined this market-data request.
    fn available(
        &self,
        message: &Message,
        id: AdapterId,
        not_supported: &HashSet<AdapterId>,
    ) -> Option<Arc<dyn MessageAdapter>> {
        if message.kind() == MessageKind::MarketData && not_supported.contains(&id) {
            return None;
        }
        self.tracker.routable(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_state::ConnectionState;
    use basket_adapter::SimAdapter;
    use basket_core::{
        Capabilities, InstrumentLookup, MarketDataRequest, PortfolioLookup, SecurityId,
        TransactionId,
    };

    struct Fixture {
        tracker: Arc<ConnectionStateTracker>,
        routes: Arc<OrderRoutingState>,
        router: AdapterRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let tracker = Arc::new(ConnectionStateTracker::new(false));
            let routes = Arc::new(OrderRoutingState::new());
            let router = AdapterRouter::new(tracker.clone(), routes.clone());
            Self {
                tracker,
                routes,
                router,
            }
        }

        fn add(&self, name: &str, caps: Capabilities) -> AdapterId {
            let adapter: Arc<dyn MessageAdapter> = Arc::new(SimAdapter::new(name, caps));
            let id = adapter.id();
            self.tracker.register(adapter);
            self.tracker.set_state(id, ConnectionState::Connected);
            id
        }

        fn names(&self, message: &Message) -> Vec<String> {
            self.router
                .select_destinations(message, &HashSet::new())
                .iter()
                .map(|d| d.adapter.name().to_string())
                .collect()
        }
    }

    fn aapl() -> SecurityId {
        SecurityId::new("AAPL", "NASDAQ")
    }

    fn instruments() -> Capabilities {
        Capabilities::new().with_message_kind(MessageKind::InstrumentLookup)
    }

    #[test]
    fn test_bulk_lookup_requires_bulk_support() {
        let fx = Fixture::new();
        fx.add("bulk", instruments().with_bulk_download(DataKind::Securities));
        fx.add("plain", instruments());

        let all = Message::from(InstrumentLookup::new(TransactionId::new(1), None));
        assert_eq!(fx.names(&all), vec!["bulk"]);

        let one = Message::from(InstrumentLookup::new(TransactionId::new(2), Some(aapl())));
        assert_eq!(fx.names(&one), vec!["bulk", "plain"]);
    }

    #[test]
    fn test_portfolio_pin_wins() {
        let fx = Fixture::new();
        fx.add("a", Capabilities::trading());
        let b = fx.add("b", Capabilities::trading());
        fx.routes.set_portfolio_adapter("acc-1", b);

        let lookup = Message::from(PortfolioLookup::new(TransactionId::new(1), Some("ACC-1".into())));
        assert_eq!(fx.names(&lookup), vec!["b"]);

        fx.tracker.set_state(b, ConnectionState::Disconnected);
        assert!(fx.names(&lookup).is_empty());
    }

    #[test]
    fn test_security_pin_skips_capabilities_and_falls_back() {
        let fx = Fixture::new();
        fx.add("ticks", Capabilities::new().with_market_data(DataKind::Ticks));
        let pinned = fx.add("pinned", Capabilities::new());
        fx.routes.set_security_adapter(aapl(), None, pinned);

        let request = Message::from(MarketDataRequest::subscribe(
            TransactionId::new(1),
            DataKind::Ticks,
            Some(aapl()),
        ));
        assert_eq!(fx.names(&request), vec!["pinned"]);

        fx.tracker.set_state(pinned, ConnectionState::Failed);
        assert_eq!(fx.names(&request), vec!["ticks"]);
    }

    #[test]
    fn test_depth_built_from_order_log() {
        let fx = Fixture::new();
        fx.add("log", Capabilities::new().with_market_data(DataKind::OrderLog));
        fx.add("none", Capabilities::new().with_market_data(DataKind::Candles));

        let request = Message::from(MarketDataRequest::subscribe(
            TransactionId::new(1),
            DataKind::MarketDepth,
            Some(aapl()),
        ));
        let destinations = fx.router.select_destinations(&request, &HashSet::new());
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].build_from, Some(DataKind::OrderLog));
    }

    #[test]
    fn test_news_without_security_skips_security_only() {
        let fx = Fixture::new();
        fx.add(
            "scoped",
            Capabilities::new()
                .with_market_data(DataKind::News)
                .with_security_news_only(),
        );
        fx.add("wire", Capabilities::new().with_market_data(DataKind::News));

        let all_news = Message::from(MarketDataRequest::subscribe(
            TransactionId::new(1),
            DataKind::News,
            None,
        ));
        assert_eq!(fx.names(&all_news), vec!["wire"]);
    }

    #[test]
    fn test_not_supported_applies_to_market_data_only() {
        let fx = Fixture::new();
        let a = fx.add(
            "a",
            instruments()
                .with_market_data(DataKind::Candles)
                .with_bulk_download(DataKind::Securities),
        );
        fx.add("b", instruments().with_market_data(DataKind::Candles));
        let excluded: HashSet<AdapterId> = [a].into_iter().collect();

        let candles = Message::from(MarketDataRequest::subscribe(
            TransactionId::new(1),
            DataKind::Candles,
            Some(aapl()),
        ));
        let picked = fx.router.select_destinations(&candles, &excluded);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].adapter.name(), "b");

        let lookup = Message::from(InstrumentLookup::new(TransactionId::new(2), Some(aapl())));
        assert_eq!(fx.router.select_destinations(&lookup, &excluded).len(), 2);
    }

    #[test]
    fn test_explicit_adapter() {
        let fx = Fixture::new();
        fx.add("a", instruments());
        let b = fx.add("b", Capabilities::new());

        let mut lookup = InstrumentLookup::new(TransactionId::new(1), Some(aapl()));
        lookup.header.adapter = Some(b);
        assert_eq!(fx.names(&lookup.into()), vec!["b"]);
    }

    #[test]
    fn test_disconnected_adapters_skipped() {
        let fx = Fixture::new();
        let a = fx.add("a", instruments());
        fx.add("b", instruments());
        fx.tracker.set_state(a, ConnectionState::Disconnected);

        let lookup = Message::from(InstrumentLookup::new(TransactionId::new(1), Some(aapl())));
        assert_eq!(fx.names(&lookup), vec!["b"]);
    }
}
