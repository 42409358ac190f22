//! Order routing state.
//!
//! Portfolio and security pins, plus the backend that owns each live
//! order so cancels and replaces follow the registration.

use basket_core::{AdapterId, DataKind, SecurityId, TransactionId};
use dashmap::DashMap;
use tracing::debug;

/// Pins and order ownership. Each table is a separate concurrent map.
#[derive(Default)]
pub struct OrderRoutingState {
    /// Keyed by lowercase portfolio name.
    portfolios: DashMap<String, AdapterId>,
    /// `None` data kind pins every kind for the security.
    securities: DashMap<(SecurityId, Option<DataKind>), AdapterId>,
    orders: DashMap<TransactionId, AdapterId>,
}

impl OrderRoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every request for `portfolio` to `adapter`.
    pub fn set_portfolio_adapter(&self, portfolio: &str, adapter: AdapterId) {
        debug!(portfolio, %adapter, "Pinned portfolio");
        self.portfolios.insert(portfolio.to_lowercase(), adapter);
    }

    /// Drop a portfolio pin, returning the backend it named.
    pub fn remove_portfolio_adapter(&self, portfolio: &str) -> Option<AdapterId> {
        self.portfolios
            .remove(&portfolio.to_lowercase())
            .map(|(_, adapter)| adapter)
    }

    /// Portfolio names compare case-insensitively.
    pub fn portfolio_adapter(&self, portfolio: &str) -> Option<AdapterId> {
        self.portfolios
            .get(&portfolio.to_lowercase())
            .map(|entry| *entry.value())
    }

    /// Pin a security, for one data kind or with `None` for all.
    pub fn set_security_adapter(
        &self,
        security_id: SecurityId,
        data_kind: Option<DataKind>,
        adapter: AdapterId,
    ) {
        debug!(security = %security_id, ?data_kind, %adapter, "Pinned security");
        self.securities.insert((security_id, data_kind), adapter);
    }

    /// Drop the pin for exactly this key; the all-kinds pin is separate.
    pub fn remove_security_adapter(
        &self,
        security_id: &SecurityId,
        data_kind: Option<DataKind>,
    ) -> Option<AdapterId> {
        self.securities
            .remove(&(security_id.clone(), data_kind))
            .map(|(_, adapter)| adapter)
    }

    /// Pin for the exact data kind, falling back to the all-kinds pin.
    pub fn security_adapter(
        &self,
        security_id: &SecurityId,
        data_kind: Option<DataKind>,
    ) -> Option<AdapterId> {
        if data_kind.is_some() {
            if let Some(entry) = self.securities.get(&(security_id.clone(), data_kind)) {
                return Some(*entry.value());
            }
        }
        self.securities
            .get(&(security_id.clone(), None))
            .map(|entry| *entry.value())
    }

    /// Remember the backend that took an order or a follow-up on it.
    pub fn record_order(&self, transaction_id: TransactionId, adapter: AdapterId) {
        self.orders.insert(transaction_id, adapter);
    }

    /// Backend owning `transaction_id`, if it is a known order.
    pub fn order_adapter(&self, transaction_id: TransactionId) -> Option<AdapterId> {
        self.orders.get(&transaction_id).map(|entry| *entry.value())
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Forget order ownership. Pins are configuration and survive.
    pub fn reset(&self) {
        self.orders.clear();
    }

    /// Drop every pin and order owned by a removed backend.
    pub fn forget_adapter(&self, adapter: AdapterId) {
        self.portfolios.retain(|_, a| *a != adapter);
        self.securities.retain(|_, a| *a != adapter);
        self.orders.retain(|_, a| *a != adapter);
    }
}
