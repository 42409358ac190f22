//! Basket router façade.
//!
//! Presents many backends as one connection. Requests go in through
//! `send_in_message`; every reply, from whichever backend, comes out of
//! the single caller channel handed to `new`.
//!
//! Each connected backend's reply stream is drained by its own task. The
//! routing path itself never awaits, so calls must happen inside a tokio
//! runtime but are otherwise synchronous.

use crate::config::RouterConfig;
use crate::connection_manager::BoundConnection;
use crate::connection_state::ConnectionSnapshot;
use crate::error::{RoutingError, RoutingResult};
use crate::manager::{BasketRoutingManager, ProcessOutput, RoutingState};
use basket_adapter::{MessageAdapter, PipelineBuilder};
use basket_core::{AdapterId, DataKind, IdGenerator, Message, SecurityId, TransactionId};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct RouterShared {
    manager: BasketRoutingManager,
    out_tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    tasks: Mutex<HashMap<AdapterId, JoinHandle<()>>>,
}

pub struct BasketRouter {
    shared: Arc<RouterShared>,
}

impl BasketRouter {
    pub fn new(config: RouterConfig, out_tx: mpsc::UnboundedSender<Message>) -> Self {
        let builder = PipelineBuilder::new(config.pipeline_config());
        Self::with_pipeline(config, builder, out_tx)
    }

    /// Router whose backends are wrapped by `builder`, e.g. one carrying
    /// extra stage factories.
    pub fn with_pipeline(
        config: RouterConfig,
        builder: PipelineBuilder,
        out_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self::with_ids(config, builder, Arc::new(IdGenerator::new()), out_tx)
    }

    /// Router minting child ids from a generator shared with the caller.
    pub fn with_ids(
        config: RouterConfig,
        builder: PipelineBuilder,
        ids: Arc<IdGenerator>,
        out_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let state = RoutingState::new(&config);
        let manager = BasketRoutingManager::new(config, ids, state, builder);
        Self {
            shared: Arc::new(RouterShared {
                manager,
                out_tx,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Generator the caller must use for its own transaction ids.
    pub fn transaction_ids(&self) -> Arc<IdGenerator> {
        self.shared.manager.transaction_ids().clone()
    }

    /// Route one request. Replies arrive on the caller channel.
    ///
    /// A token canceled mid-dispatch stops further children; the caller
    /// then receives a `Canceled` reply once sent children have answered.
    pub fn send_in_message(&self, message: Message, cancel: &CancellationToken) -> RoutingResult<()> {
        let output = self.shared.manager.process_in(message, cancel)?;
        deliver(&self.shared, output);
        Ok(())
    }

    pub fn add_adapter(&self, adapter: Arc<dyn MessageAdapter>) -> RoutingResult<()> {
        info!(adapter = %adapter.name(), id = %adapter.id(), "Adding adapter");
        let output = self.shared.manager.add_adapter(adapter)?;
        deliver(&self.shared, output);
        Ok(())
    }

    pub fn remove_adapter(&self, id: AdapterId) -> RoutingResult<()> {
        let output = self.shared.manager.remove_adapter(id)?;
        if let Some(task) = self.shared.tasks.lock().remove(&id) {
            task.abort();
        }
        deliver(&self.shared, output);
        Ok(())
    }

    pub fn adapters(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.shared.manager.adapters()
    }

    /// Takes effect at the backend's next connect.
    pub fn apply_heartbeat(&self, id: AdapterId, enabled: bool) -> RoutingResult<()> {
        self.shared.manager.apply_heartbeat(id, enabled)
    }

    pub fn set_ignore_extra_adapters(&self, ignore: bool) {
        self.shared.manager.set_ignore_extra_adapters(ignore);
    }

    pub fn set_portfolio_route(&self, portfolio: &str, adapter: AdapterId) -> RoutingResult<()> {
        self.ensure_registered(adapter)?;
        self.orders().set_portfolio_adapter(portfolio, adapter);
        Ok(())
    }

    pub fn remove_portfolio_route(&self, portfolio: &str) -> Option<AdapterId> {
        self.orders().remove_portfolio_adapter(portfolio)
    }

    /// Pin a security, for one data kind or (with `None`) for all of them.
    pub fn set_security_route(
        &self,
        security_id: SecurityId,
        data_kind: Option<DataKind>,
        adapter: AdapterId,
    ) -> RoutingResult<()> {
        self.ensure_registered(adapter)?;
        self.orders()
            .set_security_adapter(security_id, data_kind, adapter);
        Ok(())
    }

    pub fn remove_security_route(
        &self,
        security_id: &SecurityId,
        data_kind: Option<DataKind>,
    ) -> Option<AdapterId> {
        self.orders().remove_security_adapter(security_id, data_kind)
    }

    pub fn connection_states(&self) -> Vec<ConnectionSnapshot> {
        self.shared.manager.connection_states()
    }

    pub fn subscribers(&self, data_kind: DataKind) -> Vec<TransactionId> {
        self.shared.manager.subscribers(data_kind)
    }

    pub fn config(&self) -> &RouterConfig {
        self.shared.manager.config()
    }

    /// Stop every reply task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .shared
            .tasks
            .lock()
            .drain()
            .map(|(_, task)| task)
            .collect();
        let count = tasks.len();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "Reply task ended abnormally");
                }
            }
        }
        info!(tasks = count, "Basket router shut down");
    }

    fn orders(&self) -> &crate::order_routing::OrderRoutingState {
        &self.shared.manager.state().orders
    }

    fn ensure_registered(&self, adapter: AdapterId) -> RoutingResult<()> {
        if self.shared.manager.state().tracker.backend(adapter).is_some() {
            Ok(())
        } else {
            Err(RoutingError::UnknownAdapter(adapter))
        }
    }
}

impl Drop for BasketRouter {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Hand results to the caller, start reply tasks and run loop-backs
/// until nothing is left.
fn deliver(shared: &Arc<RouterShared>, output: ProcessOutput) {
    let mut queue = VecDeque::from([output]);
    while let Some(output) = queue.pop_front() {
        for message in output.out {
            if shared.out_tx.send(message).is_err() {
                debug!("Caller channel closed, reply dropped");
            }
        }
        for connection in output.connections {
            spawn_reply_task(shared, connection);
        }
        for message in output.loopback {
            let token = shared.shutdown.child_token();
            match shared.manager.process_in(message, &token) {
                Ok(next) => queue.push_back(next),
                Err(e) => error!(error = %e, "Loop-back request failed"),
            }
        }
    }
}

fn spawn_reply_task(shared: &Arc<RouterShared>, connection: BoundConnection) {
    let BoundConnection {
        adapter,
        name,
        mut replies,
    } = connection;
    let task_shared = shared.clone();
    let shutdown = shared.shutdown.clone();

    let task = tokio::spawn(async move {
        debug!(adapter = %name, "Reply task started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = replies.recv() => {
                    let Some(reply) = reply else {
                        debug!(adapter = %name, "Reply stream closed");
                        break;
                    };
                    match task_shared.manager.process_out(adapter, reply) {
                        Ok(output) => deliver(&task_shared, output),
                        Err(e) => error!(adapter = %name, error = %e, "Failed to process reply"),
                    }
                }
            }
        }
    });

    // A reconnect replaces the previous stream.
    if let Some(previous) = shared.tasks.lock().insert(adapter, task) {
        previous.abort();
    }
}
