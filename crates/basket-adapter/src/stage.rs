//! Pipeline stages.
//!
//! A stage sees every message crossing it in both directions and may
//! rewrite, hold, drop or inject messages. Stages are synchronous; the
//! pipeline owns all IO.

use basket_core::{AdapterId, Message};
use std::fmt;
use std::sync::Arc;

/// Role of a stage inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Liveness tracking. Always innermost.
    Heartbeat,
    /// Buffers traffic while the backend is offline.
    Offline,
    /// Order round-trip measurement.
    Latency,
    /// Externally supplied simulation stage (slippage, commission, PnL, channel).
    Extra,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Heartbeat => "heartbeat",
            Self::Offline => "offline",
            Self::Latency => "latency",
            Self::Extra => "extra",
        };
        f.write_str(s)
    }
}

/// Result of passing a message inward through a stage.
#[derive(Debug)]
pub enum Inbound {
    Forward(Message),
    /// The stage kept the message; it may release it later.
    Hold,
}

/// Result of passing a message outward through a stage.
#[derive(Debug)]
pub enum Outbound {
    Forward(Message),
    Drop,
    /// Forward `message` and send `resend` back inward from this stage.
    Release {
        message: Message,
        resend: Vec<Message>,
    },
}

/// Messages a stage injects on a timer tick.
#[derive(Debug, Default)]
pub struct Tick {
    /// Sent toward the backend from this stage.
    pub inward: Vec<Message>,
    /// Sent toward the router from this stage.
    pub outward: Vec<Message>,
}

impl Tick {
    pub fn is_empty(&self) -> bool {
        self.inward.is_empty() && self.outward.is_empty()
    }
}

/// One decorator in an adapter pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Stops unwrapping at this pipeline (e.g. an emulator in front of a feed).
    fn presents_as_backend(&self) -> bool {
        false
    }

    fn on_inbound(&self, message: Message) -> Inbound {
        Inbound::Forward(message)
    }

    fn on_outbound(&self, message: Message) -> Outbound {
        Outbound::Forward(message)
    }

    fn on_tick(&self) -> Tick {
        Tick::default()
    }
}

/// Creates an extra stage for a backend when its pipeline is built.
#[cfg_attr(test, mockall::automock)]
pub trait StageFactory: Send + Sync {
    fn create(&self, adapter: AdapterId) -> Arc<dyn Stage>;
}
