//! Application configuration.

use crate::error::{AppError, AppResult};
use basket_adapter::SimBehavior;
use basket_core::{
    Capabilities, DataKind, InstrumentLookup, MarketDataRequest, Message, MessageKind, OrderRegister,
    OrderSide, OrderStatusRequest, PortfolioLookup, SecurityId, TransactionId,
};
use basket_routing::RouterConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One simulated backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,
    /// Request kinds served besides market data.
    #[serde(default)]
    pub message_kinds: Vec<MessageKind>,
    #[serde(default)]
    pub market_data: Vec<DataKind>,
    /// Kinds that can be downloaded in full by an empty lookup.
    #[serde(default)]
    pub bulk_download: Vec<DataKind>,
    /// News only per security.
    #[serde(default)]
    pub security_news_only: bool,
    /// Adds order registration, cancel, replace and status.
    #[serde(default)]
    pub trading: bool,
    #[serde(default)]
    pub behavior: SimBehavior,
    /// Overrides `router.heartbeat_enabled` for this backend.
    #[serde(default)]
    pub heartbeat: Option<bool>,
}

impl AdapterConfig {
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = if self.trading {
            Capabilities::trading()
        } else {
            Capabilities::new()
        };
        for kind in &self.message_kinds {
            caps = caps.with_message_kind(*kind);
        }
        for kind in &self.market_data {
            caps = caps.with_market_data(*kind);
        }
        for kind in &self.bulk_download {
            caps = caps.with_bulk_download(*kind);
        }
        if self.security_news_only {
            caps = caps.with_security_news_only();
        }
        caps
    }
}

/// Security pinned to a backend, optionally for one data kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRouteConfig {
    /// `CODE@BOARD`.
    pub security: String,
    #[serde(default)]
    pub data_kind: Option<DataKind>,
    pub adapter: String,
}

/// Explicit routes, by adapter name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// Portfolio name to adapter name.
    #[serde(default)]
    pub portfolios: HashMap<String, String>,
    #[serde(default)]
    pub securities: Vec<SecurityRouteConfig>,
}

/// A request sent once the basket starts connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestConfig {
    InstrumentLookup {
        #[serde(default)]
        security: Option<String>,
    },
    PortfolioLookup {
        #[serde(default)]
        portfolio: Option<String>,
    },
    OrderStatus {
        #[serde(default)]
        portfolio: Option<String>,
    },
    Subscribe {
        data_kind: DataKind,
        #[serde(default)]
        security: Option<String>,
    },
    Order {
        security: String,
        portfolio: String,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    },
}

impl RequestConfig {
    /// Build the request under `transaction_id`.
    pub fn to_message(&self, transaction_id: TransactionId) -> AppResult<Message> {
        let message = match self {
            Self::InstrumentLookup { security } => {
                InstrumentLookup::new(transaction_id, parse_security(security.as_deref())?).into()
            }
            Self::PortfolioLookup { portfolio } => {
                PortfolioLookup::new(transaction_id, portfolio.clone()).into()
            }
            Self::OrderStatus { portfolio } => {
                let mut request = OrderStatusRequest::new(transaction_id);
                request.portfolio = portfolio.clone();
                request.into()
            }
            Self::Subscribe {
                data_kind,
                security,
            } => MarketDataRequest::subscribe(
                transaction_id,
                *data_kind,
                parse_security(security.as_deref())?,
            )
            .into(),
            Self::Order {
                security,
                portfolio,
                side,
                price,
                volume,
            } => OrderRegister {
                transaction_id,
                security_id: security.parse()?,
                portfolio: portfolio.clone(),
                side: *side,
                price: *price,
                volume: *volume,
                adapter: None,
            }
            .into(),
        };
        Ok(message)
    }
}

fn parse_security(security: Option<&str>) -> AppResult<Option<SecurityId>> {
    security
        .map(|s| s.parse::<SecurityId>().map_err(AppError::from))
        .transpose()
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    /// Market data publish interval (ms). Default: 1,000.
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    /// Stop after this long (ms). Runs until Ctrl-C when unset.
    #[serde(default)]
    pub run_duration_ms: Option<u64>,
}

fn default_publish_interval_ms() -> u64 {
    1_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            adapters: Vec::new(),
            routes: RoutesConfig::default(),
            requests: Vec::new(),
            publish_interval_ms: default_publish_interval_ms(),
            run_duration_ms: None,
        }
    }
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject names that do not resolve and values that do not parse.
    pub fn validate(&self) -> AppResult<()> {
        if self.publish_interval_ms == 0 {
            return Err(AppError::Config("publish_interval_ms must be positive".into()));
        }

        let mut names = HashSet::new();
        for adapter in &self.adapters {
            if adapter.name.is_empty() {
                return Err(AppError::Config("adapter name must not be empty".into()));
            }
            if !names.insert(adapter.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate adapter name: {}",
                    adapter.name
                )));
            }
        }

        let known = |name: &str| -> AppResult<()> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(AppError::Config(format!("route names unknown adapter: {name}")))
            }
        };
        for adapter in self.routes.portfolios.values() {
            known(adapter.as_str())?;
        }
        for route in &self.routes.securities {
            known(route.adapter.as_str())?;
            route.security.parse::<SecurityId>()?;
        }

        for request in &self.requests {
            request.to_message(TransactionId::new(1))?;
        }
        Ok(())
    }
}
