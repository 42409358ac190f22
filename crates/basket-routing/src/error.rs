//! Routing error types.
//!
//! These are failures of the router itself. Failures the caller should
//! see travel as `ReplyError` payloads on reply messages instead.

use crate::connection_state::ConnectionState;
use basket_adapter::AdapterError;
use basket_core::{AdapterId, MessageKind, ReplyError, TransactionId};
use basket_telemetry::Metrics;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum RoutingError {
    /// A routing bug. Never swallowed.
    #[error("Routing invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unexpected inbound message kind: {0}")]
    UnexpectedInbound(MessageKind),

    #[error("Transaction {0} is already being routed")]
    DuplicateParent(TransactionId),

    #[error("Unknown parent transaction {0}")]
    UnknownParent(TransactionId),

    #[error("Invalid child transaction id {0}")]
    InvalidChildId(TransactionId),

    #[error("Unknown adapter {0}")]
    UnknownAdapter(AdapterId),

    /// Ownership is keyed by id, so a wrapper must report its backend's.
    #[error("Adapter {adapter} does not report the id of its backend {backend}")]
    IdentityMismatch { adapter: String, backend: String },

    #[error("Adapter {adapter} is {state}")]
    ConnectionUnavailable {
        adapter: String,
        state: ConnectionState,
    },

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

impl RoutingError {
    /// Build an invariant violation, logging it and counting it.
    pub fn invariant(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!(detail = %detail, "Routing invariant violated");
        Metrics::invariant_violation();
        Self::InvariantViolation(detail)
    }

    /// Reply error describing this failure to the caller.
    pub fn to_reply_error(&self) -> ReplyError {
        match self {
            Self::ConnectionUnavailable { .. } | Self::Adapter(_) | Self::UnknownAdapter(_) => {
                ReplyError::connection(self.to_string())
            }
            _ => ReplyError::rejected(self.to_string()),
        }
    }
}

pub type RoutingResult<T> = Result<T, RoutingError>;
