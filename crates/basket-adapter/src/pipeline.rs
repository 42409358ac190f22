//! Adapter pipeline.
//!
//! Wraps a backend in an ordered list of stages, innermost first:
//! heartbeat, offline, then latency and externally supplied extras.
//! Suppressing extras never removes heartbeat or offline wrapping.

use crate::adapter::MessageAdapter;
use crate::error::{AdapterError, AdapterResult};
use crate::heartbeat::HeartbeatStage;
use crate::latency::LatencyStage;
use crate::offline::OfflineStage;
use crate::stage::{Inbound, Outbound, Stage, StageFactory, StageKind};
use basket_core::{AdapterId, Capabilities, Message};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Settings applied when a pipeline is built.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub support_offline: bool,
    pub latency_tracking: bool,
    /// Skip latency and extra stages.
    pub ignore_extra_adapters: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            support_offline: true,
            latency_tracking: true,
            ignore_extra_adapters: false,
        }
    }
}

/// Builds pipelines around backends.
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    extras: Vec<Arc<dyn StageFactory>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            extras: Vec::new(),
        }
    }

    /// Register a factory for an extra stage, applied outermost in order.
    pub fn with_extra(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.extras.push(factory);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn set_ignore_extra_adapters(&mut self, ignore: bool) {
        self.config.ignore_extra_adapters = ignore;
    }

    /// Wrap `inner`, with a heartbeat stage when `heartbeat` is set.
    pub fn build(&self, inner: Arc<dyn MessageAdapter>, heartbeat: bool) -> AdapterPipeline {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        if heartbeat {
            stages.push(Arc::new(HeartbeatStage::new(
                self.config.heartbeat_interval,
                self.config.heartbeat_timeout,
            )));
        }

        if self.config.support_offline {
            stages.push(Arc::new(OfflineStage::new()));
        }

        if !self.config.ignore_extra_adapters {
            if self.config.latency_tracking {
                stages.push(Arc::new(LatencyStage::new()));
            }
            for factory in &self.extras {
                stages.push(factory.create(inner.id()));
            }
        }

        debug!(
            adapter = %inner.name(),
            stages = ?stages.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            "Built adapter pipeline"
        );

        let tick_interval = heartbeat.then(|| tick_interval(self.config.heartbeat_interval));

        AdapterPipeline {
            chain: Arc::new(Chain { inner, stages }),
            builder: self.clone(),
            heartbeat,
            tick_interval,
            relay: Mutex::new(None),
        }
    }
}

fn tick_interval(heartbeat_interval: Duration) -> Duration {
    (heartbeat_interval / 2).max(Duration::from_millis(10))
}

/// Stages plus the backend they wrap.
struct Chain {
    inner: Arc<dyn MessageAdapter>,
    /// Innermost first.
    stages: Vec<Arc<dyn Stage>>,
}

impl Chain {
    /// Pass `message` inward through `stages[..start]`, then to the backend.
    fn send_from(&self, start: usize, message: Message) -> AdapterResult<()> {
        let mut message = message;
        for stage in self.stages[..start].iter().rev() {
            match stage.on_inbound(message) {
                Inbound::Forward(m) => message = m,
                Inbound::Hold => return Ok(()),
            }
        }
        self.inner.send_in(message)
    }

    /// Pass `message` outward through `stages[start..]`, then to `out`.
    ///
    /// Returns `false` once `out` is closed.
    fn deliver_out(
        &self,
        start: usize,
        message: Message,
        out: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let mut message = message;
        for (index, stage) in self.stages.iter().enumerate().skip(start) {
            match stage.on_outbound(message) {
                Outbound::Forward(m) => message = m,
                Outbound::Drop => return true,
                Outbound::Release {
                    message: m,
                    resend,
                } => {
                    for held in resend {
                        if let Err(e) = self.send_from(index, held) {
                            warn!(adapter = %self.inner.name(), error = %e, "Replay failed");
                        }
                    }
                    message = m;
                }
            }
        }
        out.send(message).is_ok()
    }

    fn tick(&self, out: &mpsc::UnboundedSender<Message>) -> bool {
        for (index, stage) in self.stages.iter().enumerate() {
            let tick = stage.on_tick();
            for message in tick.inward {
                if let Err(e) = self.send_from(index, message) {
                    warn!(adapter = %self.inner.name(), error = %e, "Tick send failed");
                }
            }
            for message in tick.outward {
                if !self.deliver_out(index + 1, message, out) {
                    return false;
                }
            }
        }
        true
    }
}

/// A backend wrapped in stages. Reports the backend's identity.
pub struct AdapterPipeline {
    chain: Arc<Chain>,
    builder: PipelineBuilder,
    heartbeat: bool,
    tick_interval: Option<Duration>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterPipeline {
    /// Stage kinds, innermost first.
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.chain.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.chain
            .stages
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat
    }

    pub fn backend(&self) -> &Arc<dyn MessageAdapter> {
        &self.chain.inner
    }
}

impl MessageAdapter for AdapterPipeline {
    fn id(&self) -> AdapterId {
        self.chain.inner.id()
    }

    fn name(&self) -> &str {
        self.chain.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.chain.inner.capabilities()
    }

    fn send_in(&self, message: Message) -> AdapterResult<()> {
        if self.relay.lock().is_none() {
            return Err(AdapterError::NotBound(self.name().to_string()));
        }
        self.chain.send_from(self.chain.stages.len(), message)
    }

    /// Spawns the relay task; must be called inside a tokio runtime.
    fn bind(&self, out: mpsc::UnboundedSender<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.chain.inner.bind(tx);

        let chain = self.chain.clone();
        let tick_every = self.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tick_every.map(tokio::time::interval);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(message) => {
                            if !chain.deliver_out(0, message, &out) {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = next_tick(&mut ticker) => {
                        if !chain.tick(&out) {
                            break;
                        }
                    }
                }
            }
            debug!(adapter = %chain.inner.name(), "Pipeline relay stopped");
        });

        if let Some(previous) = self.relay.lock().replace(handle) {
            previous.abort();
        }
    }

    fn clone_adapter(&self) -> Arc<dyn MessageAdapter> {
        Arc::new(
            self.builder
                .build(self.chain.inner.clone_adapter(), self.heartbeat),
        )
    }

    fn inner(&self) -> Option<Arc<dyn MessageAdapter>> {
        Some(self.chain.inner.clone())
    }

    fn presents_as_backend(&self) -> bool {
        self.chain.stages.iter().any(|s| s.presents_as_backend())
    }
}

impl Drop for AdapterPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.relay.lock().take() {
            handle.abort();
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::underlying_adapter;
    use crate::sim::SimAdapter;
    use crate::stage::MockStageFactory;
    use basket_core::{ConnectMessage, DataKind, MarketDataRequest, TransactionId};
    use std::time::Duration;

    struct EmulatorStage;

    impl Stage for EmulatorStage {
        fn name(&self) -> &str {
            "emulator"
        }

        fn kind(&self) -> StageKind {
            StageKind::Extra
        }

        fn presents_as_backend(&self) -> bool {
            true
        }
    }

    fn sim() -> Arc<dyn MessageAdapter> {
        Arc::new(SimAdapter::new("sim", Capabilities::new().with_market_data(DataKind::Ticks)))
    }

    #[test]
    fn test_heartbeat_innermost_offline_next() {
        let pipeline = PipelineBuilder::default().build(sim(), true);
        assert_eq!(
            pipeline.stage_kinds(),
            vec![StageKind::Heartbeat, StageKind::Offline, StageKind::Latency]
        );
    }

    #[test]
    fn test_ignore_extra_keeps_heartbeat_and_offline() {
        let mut factory = MockStageFactory::new();
        factory.expect_create().never();

        let mut builder = PipelineBuilder::default().with_extra(Arc::new(factory));
        builder.set_ignore_extra_adapters(true);
        let pipeline = builder.build(sim(), true);
        assert_eq!(
            pipeline.stage_kinds(),
            vec![StageKind::Heartbeat, StageKind::Offline]
        );
    }

    #[test]
    fn test_heartbeat_off() {
        let pipeline = PipelineBuilder::default().build(sim(), false);
        assert_eq!(pipeline.stage_kinds()[0], StageKind::Offline);
        assert!(!pipeline.has_heartbeat());
    }

    #[test]
    fn test_extras_outermost_in_order() {
        let mut factory = MockStageFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|_| Arc::new(EmulatorStage) as Arc<dyn Stage>);

        let pipeline = PipelineBuilder::default()
            .with_extra(Arc::new(factory))
            .build(sim(), true);
        assert_eq!(pipeline.stage_kinds().last(), Some(&StageKind::Extra));
        assert_eq!(pipeline.stage_names().last().map(String::as_str), Some("emulator"));
    }

    #[test]
    fn test_underlying_adapter_stops_at_marker() {
        let backend = sim();
        let plain: Arc<dyn MessageAdapter> =
            Arc::new(PipelineBuilder::default().build(backend.clone(), false));
        assert_eq!(underlying_adapter(&plain).name(), "sim");
        assert!(!plain.presents_as_backend());

        let mut factory = MockStageFactory::new();
        factory
            .expect_create()
            .returning(|_| Arc::new(EmulatorStage) as Arc<dyn Stage>);
        let emulated: Arc<dyn MessageAdapter> = Arc::new(
            PipelineBuilder::default()
                .with_extra(Arc::new(factory))
                .build(backend, false),
        );
        assert!(emulated.presents_as_backend());
        assert!(Arc::ptr_eq(&underlying_adapter(&emulated), &emulated));
    }

    #[test]
    fn test_send_before_bind_fails() {
        let pipeline = PipelineBuilder::default().build(sim(), false);
        let result = pipeline.send_in(Message::Connect(ConnectMessage::default()));
        assert!(matches!(result, Err(AdapterError::NotBound(_))));
    }

    #[tokio::test]
    async fn test_relay_applies_stages() {
        let pipeline = PipelineBuilder::default().build(sim(), false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        pipeline.bind(out_tx);

        // Held by the offline stage until the backend connects.
        pipeline
            .send_in(MarketDataRequest::subscribe(TransactionId::new(1), DataKind::Ticks, None).into())
            .unwrap();
        pipeline
            .send_in(Message::Connect(ConnectMessage::default()))
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Message::Connect(ref c) if c.error.is_none()));

        let second = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            second,
            Message::SubscriptionResponse(ref r) if r.original_transaction_id == TransactionId::new(1)
        ));
    }

    #[test]
    fn test_clone_adapter_rebuilds_stages() {
        let pipeline = PipelineBuilder::default().build(sim(), true);
        let copy = pipeline.clone_adapter();
        assert_eq!(copy.name(), "sim");
        assert_ne!(copy.id(), pipeline.id());
    }
}
