//! Prometheus metrics and structured logging for the basket router.
//!
//! - Prometheus metrics for routed requests, fan-out, aggregation and retries
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
