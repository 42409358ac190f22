//! Prometheus metrics for the basket router.
//!
//! Covers:
//! - Requests routed, by kind and dispatch path
//! - Fan-out children and aggregated parent outcomes
//! - Not-supported retries and routing misses
//! - Buffered (pending) messages
//! - Per-backend connection state
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration
//! failure means duplicate metric names, a startup configuration error.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge_vec,
    CounterVec, Encoder, GaugeVec, IntCounter, IntGaugeVec, TextEncoder,
};

/// Requests routed to at least one backend.
/// Labels: kind, path (fan_out/failover/order/control)
pub static REQUESTS_ROUTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_requests_routed_total",
        "Requests routed to at least one backend",
        &["kind", "path"]
    )
    .unwrap()
});

/// Child requests minted by fan-out.
pub static FANOUT_CHILDREN_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_fanout_children_total",
        "Child requests dispatched by fan-out",
        &["kind"]
    )
    .unwrap()
});

/// Aggregated parent outcomes emitted to the caller.
/// Labels: outcome (ok/error/canceled/online/finished/failed)
pub static AGGREGATED_REPLIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_aggregated_replies_total",
        "Aggregated parent outcomes emitted to the caller",
        &["outcome"]
    )
    .unwrap()
});

/// Re-dispatches after a backend declined a failover subscription.
pub static NOT_SUPPORTED_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_not_supported_retries_total",
        "Failover re-dispatches after a not-supported reply",
        &["data_kind"]
    )
    .unwrap()
});

/// Requests answered with a routing-miss error.
pub static ROUTING_MISS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_routing_miss_total",
        "Requests no backend could take",
        &["kind"]
    )
    .unwrap()
});

/// Replies dropped before reaching the caller.
/// Labels: reason (retired/unexpected)
pub static DROPPED_REPLIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "basket_dropped_replies_total",
        "Backend replies dropped before reaching the caller",
        &["reason"]
    )
    .unwrap()
});

/// Messages currently buffered.
/// Labels: queue (connection/unrouted)
pub static PENDING_MESSAGES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "basket_pending_messages",
        "Messages buffered until a backend is ready",
        &["queue"]
    )
    .unwrap()
});

/// Backend connection state (1 = current state).
pub static ADAPTER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "basket_adapter_state",
        "Backend connection state (1=active, 0=inactive)",
        &["adapter", "state"]
    )
    .unwrap()
});

/// Routing invariant violations.
pub static INVARIANT_VIOLATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "basket_invariant_violations_total",
        "Routing invariant violations (routing bugs)"
    )
    .unwrap()
});

const ADAPTER_STATES: [&str; 4] = ["connecting", "connected", "disconnected", "failed"];

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record a request routed through `path`.
    pub fn request_routed(kind: &str, path: &str) {
        REQUESTS_ROUTED_TOTAL.with_label_values(&[kind, path]).inc();
    }

    /// Record `count` fan-out children for one request.
    pub fn fanout_children(kind: &str, count: usize) {
        FANOUT_CHILDREN_TOTAL
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }

    /// Record an aggregated outcome.
    pub fn aggregated_reply(outcome: &str) {
        AGGREGATED_REPLIES_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record a failover retry.
    pub fn not_supported_retry(data_kind: &str) {
        NOT_SUPPORTED_RETRIES_TOTAL
            .with_label_values(&[data_kind])
            .inc();
    }

    /// Record a routing miss.
    pub fn routing_miss(kind: &str) {
        ROUTING_MISS_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Record a dropped reply.
    pub fn reply_dropped(reason: &str) {
        DROPPED_REPLIES_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Set the size of a pending queue.
    pub fn pending_set(queue: &str, len: usize) {
        PENDING_MESSAGES.with_label_values(&[queue]).set(len as i64);
    }

    /// Set a backend's connection state.
    /// Only the active state is set to 1, all others to 0.
    pub fn adapter_state_set(adapter: &str, state: &str) {
        for s in ADAPTER_STATES {
            ADAPTER_STATE.with_label_values(&[adapter, s]).set(0.0);
        }
        ADAPTER_STATE.with_label_values(&[adapter, state]).set(1.0);
    }

    /// Record an invariant violation.
    pub fn invariant_violation() {
        INVARIANT_VIOLATIONS_TOTAL.inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_state_is_exclusive() {
        Metrics::adapter_state_set("sim-test", "connecting");
        Metrics::adapter_state_set("sim-test", "connected");
        assert_eq!(
            ADAPTER_STATE
                .with_label_values(&["sim-test", "connected"])
                .get(),
            1.0
        );
        assert_eq!(
            ADAPTER_STATE
                .with_label_values(&["sim-test", "connecting"])
                .get(),
            0.0
        );
    }

    #[test]
    fn test_render_contains_registered_metric() {
        Metrics::request_routed("market_data", "fan_out");
        let text = Metrics::render().unwrap();
        assert!(text.contains("basket_requests_routed_total"));
    }
}
