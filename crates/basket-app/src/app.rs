//! Main application orchestration.
//!
//! Builds the basket from configuration:
//! - one simulated backend per `[[adapters]]` entry
//! - heartbeat overrides and `[routes]` pins
//! - the `[[requests]]` startup script
//!
//! then runs until the configured duration elapses or Ctrl-C.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use basket_adapter::{MessageAdapter, SimAdapter};
use basket_core::{ConnectMessage, DisconnectMessage, Message, MessageKind, SecurityId};
use basket_routing::BasketRouter;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for backends to acknowledge a disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// What the caller saw during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Replies received, by message kind.
    pub replies: BTreeMap<String, u64>,
    /// Replies carrying an error.
    pub errors: u64,
    pub connected: bool,
    pub publish_rounds: u64,
}

impl RunSummary {
    fn record(&mut self, message: &Message) {
        *self
            .replies
            .entry(message.kind().as_str().to_string())
            .or_default() += 1;
        if message.reply_error().is_some() {
            self.errors += 1;
        }
    }

    pub fn count(&self, kind: MessageKind) -> u64 {
        self.replies.get(kind.as_str()).copied().unwrap_or(0)
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    router: BasketRouter,
    replies: mpsc::UnboundedReceiver<Message>,
    sims: Vec<Arc<SimAdapter>>,
    cancel: CancellationToken,
    summary: RunSummary,
    price: Decimal,
}

impl Application {
    /// Create the router and register every configured backend.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let router = BasketRouter::new(config.router.clone(), reply_tx);

        let mut sims = Vec::with_capacity(config.adapters.len());
        let mut by_name = HashMap::new();
        for adapter in &config.adapters {
            let sim = Arc::new(SimAdapter::with_behavior(
                adapter.name.clone(),
                adapter.capabilities(),
                adapter.behavior.clone(),
            ));
            router.add_adapter(sim.clone())?;
            if let Some(enabled) = adapter.heartbeat {
                router.apply_heartbeat(sim.id(), enabled)?;
            }
            by_name.insert(adapter.name.clone(), sim.id());
            sims.push(sim);
        }
        info!(adapters = sims.len(), "Registered simulated adapters");

        let resolve = |name: &str| {
            by_name
                .get(name)
                .copied()
                .ok_or_else(|| AppError::Config(format!("unknown adapter: {name}")))
        };
        for (portfolio, adapter) in &config.routes.portfolios {
            router.set_portfolio_route(portfolio, resolve(adapter.as_str())?)?;
        }
        for route in &config.routes.securities {
            let security: SecurityId = route.security.parse()?;
            router.set_security_route(security, route.data_kind, resolve(route.adapter.as_str())?)?;
        }

        Ok(Self {
            config,
            router,
            replies,
            sims,
            cancel: CancellationToken::new(),
            summary: RunSummary::default(),
            price: Decimal::new(100, 0),
        })
    }

    pub fn router(&self) -> &BasketRouter {
        &self.router
    }

    pub fn adapters(&self) -> &[Arc<SimAdapter>] {
        &self.sims
    }

    /// Token canceling scripted requests still being dispatched.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect, play the request script, then publish until stopped.
    pub async fn run(mut self) -> AppResult<RunSummary> {
        info!("Starting application");
        self.router
            .send_in_message(ConnectMessage::default().into(), &self.cancel)?;
        self.send_requests()?;

        let mut publish =
            tokio::time::interval(Duration::from_millis(self.config.publish_interval_ms));
        // The first tick completes immediately.
        publish.tick().await;

        let deadline = self.config.run_duration_ms.map(Duration::from_millis);
        let stop = async move {
            match deadline {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(stop);

        info!("Entering main event loop");
        loop {
            tokio::select! {
                Some(reply) = self.replies.recv() => self.handle_reply(reply),

                _ = publish.tick() => self.publish(),

                _ = &mut stop => {
                    info!("Run duration elapsed");
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await?;
        Ok(self.summary)
    }

    fn send_requests(&mut self) -> AppResult<()> {
        let ids = self.router.transaction_ids();
        for request in &self.config.requests {
            let message = request.to_message(ids.next_id())?;
            debug!(kind = %message.kind(), tx = ?message.transaction_id(), "Sending scripted request");
            self.router.send_in_message(message, &self.cancel)?;
        }
        info!(requests = self.config.requests.len(), "Startup requests sent");
        Ok(())
    }

    fn handle_reply(&mut self, reply: Message) {
        self.summary.record(&reply);
        match &reply {
            Message::Connect(c) => match &c.error {
                None => {
                    self.summary.connected = true;
                    info!("Basket connected");
                }
                Some(e) => warn!(error = %e, "Basket failed to connect"),
            },
            Message::Disconnect(_) => info!("Basket disconnected"),
            other => match other.reply_error() {
                Some(e) => warn!(
                    kind = %other.kind(),
                    tx = ?other.original_transaction_id(),
                    error = %e,
                    "Request failed"
                ),
                None => debug!(
                    kind = %other.kind(),
                    tx = ?other.original_transaction_id(),
                    "Reply"
                ),
            },
        }
    }

    fn publish(&mut self) {
        self.price += Decimal::new(25, 2);
        let mut published = 0;
        for sim in &self.sims {
            match sim.publish_market_data(self.price) {
                Ok(count) => published += count,
                Err(e) => debug!(adapter = %sim.name(), error = %e, "Publish skipped"),
            }
        }
        self.summary.publish_rounds += 1;
        debug!(price = %self.price, published, "Published market data");
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        info!("Disconnecting basket");
        self.cancel.cancel();
        self.router
            .send_in_message(DisconnectMessage::default().into(), &CancellationToken::new())?;

        let grace = tokio::time::sleep(DISCONNECT_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                reply = self.replies.recv() => match reply {
                    Some(reply) => {
                        let done = matches!(reply, Message::Disconnect(_));
                        self.handle_reply(reply);
                        if done {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut grace => {
                    warn!("Backends did not confirm disconnect in time");
                    break;
                }
            }
        }

        self.router.shutdown().await;
        info!(
            replies = self.summary.replies.values().sum::<u64>(),
            errors = self.summary.errors,
            "Shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use basket_core::DataKind;

    fn adapter(name: &str) -> AdapterConfig {
        AdapterConfig {
            name: name.into(),
            message_kinds: Vec::new(),
            market_data: vec![DataKind::Ticks],
            bulk_download: Vec::new(),
            security_news_only: false,
            trading: false,
            behavior: Default::default(),
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_new_registers_adapters() {
        let config = AppConfig {
            adapters: vec![adapter("a"), adapter("b")],
            ..Default::default()
        };
        let app = Application::new(config).unwrap();
        assert_eq!(app.adapters().len(), 2);
        assert_eq!(app.router().adapters().len(), 2);
    }

    #[tokio::test]
    async fn test_new_rejects_unknown_route() {
        let mut config = AppConfig {
            adapters: vec![adapter("a")],
            ..Default::default()
        };
        config
            .routes
            .portfolios
            .insert("acc-1".into(), "nobody".into());
        assert!(matches!(Application::new(config), Err(AppError::Config(_))));
    }

    #[test]
    fn test_run_stops_after_duration() {
        let config = AppConfig {
            publish_interval_ms: 20,
            run_duration_ms: Some(150),
            ..Default::default()
        };
        let summary = tokio_test::block_on(async {
            let app = Application::new(config).unwrap();
            app.run().await.unwrap()
        });
        assert!(summary.publish_rounds >= 1);
        assert!(!summary.connected);
    }

    #[test]
    fn test_summary_counts_errors() {
        let mut summary = RunSummary::default();
        summary.record(&ConnectMessage::default().into());
        summary.record(
            &ConnectMessage {
                error: Some(basket_core::ReplyError::connection("down")),
            }
            .into(),
        );
        assert_eq!(summary.count(MessageKind::Connect), 2);
        assert_eq!(summary.errors, 1);
    }
}
