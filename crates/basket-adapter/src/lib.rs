//! Backend connections for the basket router.
//!
//! Provides:
//! - `MessageAdapter`: the boundary every backend connection implements
//! - `AdapterPipeline`: an ordered list of stages wrapping a backend
//! - Heartbeat, offline and latency stages
//! - `SimAdapter`: an in-memory backend used by the simulator and tests

pub mod adapter;
pub mod error;
pub mod heartbeat;
pub mod latency;
pub mod offline;
pub mod pipeline;
pub mod sim;
pub mod stage;

pub use adapter::{underlying_adapter, MessageAdapter};
pub use error::{AdapterError, AdapterResult};
pub use heartbeat::{HeartbeatStage, HeartbeatStats, HeartbeatTracker};
pub use latency::LatencyStage;
pub use offline::OfflineStage;
pub use pipeline::{AdapterPipeline, PipelineBuilder, PipelineConfig};
pub use sim::{SimAdapter, SimBehavior};
pub use stage::{Inbound, Outbound, Stage, StageFactory, StageKind, Tick};
