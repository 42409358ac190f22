//! Shared harness for router integration tests.

#![allow(dead_code)]

use basket_adapter::{AdapterResult, MessageAdapter, SimAdapter, SimBehavior};
use basket_core::{
    AdapterId, Capabilities, ConnectMessage, Message, MessageKind, SecurityId, TransactionId,
};
use basket_routing::{BasketRouter, RouterConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE: Duration = Duration::from_millis(150);

pub fn test_config() -> RouterConfig {
    RouterConfig {
        heartbeat_enabled: false,
        connect_event_on_first_adapter: false,
        ..Default::default()
    }
}

pub fn aapl() -> SecurityId {
    SecurityId::new("AAPL", "NASDAQ")
}

pub struct Harness {
    pub router: BasketRouter,
    pub rx: mpsc::UnboundedReceiver<Message>,
    pub cancel: CancellationToken,
    issued: HashSet<TransactionId>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            router: BasketRouter::new(config, tx),
            rx,
            cancel: CancellationToken::new(),
            issued: HashSet::new(),
        }
    }

    pub fn add(&self, name: &str, caps: Capabilities) -> Arc<SimAdapter> {
        self.add_with(name, caps, SimBehavior::default())
    }

    pub fn add_with(&self, name: &str, caps: Capabilities, behavior: SimBehavior) -> Arc<SimAdapter> {
        let sim = Arc::new(SimAdapter::with_behavior(name, caps, behavior));
        self.router.add_adapter(sim.clone()).unwrap();
        sim
    }

    /// Connect the basket and return its connect event.
    pub async fn connect(&mut self) -> Message {
        self.router
            .send_in_message(ConnectMessage::default().into(), &self.cancel)
            .unwrap();
        self.recv_until(|m| matches!(m, Message::Connect(_)))
            .await
            .pop()
            .unwrap()
    }

    /// Caller-side id, remembered for the id-hiding check.
    pub fn next_id(&mut self) -> TransactionId {
        let id = self.router.transaction_ids().next_id();
        self.issued.insert(id);
        id
    }

    pub fn send(&self, message: impl Into<Message>) {
        self.router
            .send_in_message(message.into(), &self.cancel)
            .unwrap();
    }

    pub async fn recv(&mut self) -> Option<Message> {
        timeout(IDLE, self.rx.recv()).await.ok().flatten()
    }

    /// Everything received until `done` matches, inclusive.
    pub async fn recv_until(&mut self, done: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = timeout(REPLY_TIMEOUT, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; received so far: {seen:?}"))
                .expect("caller channel closed");
            let stop = done(&message);
            seen.push(message);
            if stop {
                return seen;
            }
        }
    }

    /// Everything received until the channel goes quiet.
    pub async fn drain(&mut self) -> Vec<Message> {
        let mut seen = Vec::new();
        while let Some(message) = self.recv().await {
            seen.push(message);
        }
        seen
    }

    /// Every id on `messages` is one the caller issued.
    pub fn assert_caller_ids(&self, messages: &[Message]) {
        for message in messages {
            if let Some(id) = message.original_transaction_id() {
                assert!(self.issued.contains(&id), "foreign id {id} on {message:?}");
            }
            if let Some(ids) = message.subscription_ids() {
                for id in &ids.subscription_ids {
                    assert!(self.issued.contains(id), "foreign id {id} on {message:?}");
                }
            }
        }
    }
}

pub fn responses_for(messages: &[Message], tx: TransactionId) -> Vec<&Message> {
    messages
        .iter()
        .filter(|m| {
            matches!(m, Message::SubscriptionResponse(r) if r.original_transaction_id == tx)
        })
        .collect()
}

pub fn is_response_for(tx: TransactionId) -> impl Fn(&Message) -> bool {
    move |m| matches!(m, Message::SubscriptionResponse(r) if r.original_transaction_id == tx)
}

pub fn count_of(sim: &SimAdapter, kind: MessageKind) -> usize {
    sim.received_of(kind).len()
}

/// Backend that fires a cancellation token when it receives market data.
pub struct CancelingAdapter {
    pub inner: Arc<SimAdapter>,
    pub token: CancellationToken,
}

impl MessageAdapter for CancelingAdapter {
    fn id(&self) -> AdapterId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn send_in(&self, message: Message) -> AdapterResult<()> {
        if message.kind() == MessageKind::MarketData {
            self.token.cancel();
        }
        self.inner.send_in(message)
    }

    fn bind(&self, out: mpsc::UnboundedSender<Message>) {
        self.inner.bind(out);
    }

    fn clone_adapter(&self) -> Arc<dyn MessageAdapter> {
        Arc::new(Self {
            inner: self.inner.clone(),
            token: self.token.clone(),
        })
    }
}
