//! Error payload carried by reply messages.
//!
//! Failures the caller must see travel as data, not as Rust errors: a
//! backend declining a request, a lost connection, or a routing miss all
//! become a `ReplyError` attached to the reply for the affected request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a reply error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyErrorKind {
    /// The backend explicitly declined the request kind or data kind.
    NotSupported,
    /// Connection-level failure (disconnect, send failure, timeout).
    Connection,
    /// No backend matched a pin or capability filter.
    RoutingMiss,
    /// Every backend a request was fanned out to failed.
    Aggregate,
    /// The dispatch was canceled by the caller.
    Canceled,
    /// The backend rejected the request for another reason.
    Rejected,
}

impl fmt::Display for ReplyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotSupported => "not supported",
            Self::Connection => "connection",
            Self::RoutingMiss => "routing miss",
            Self::Aggregate => "aggregate",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Error attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ReplyErrorKind,
    pub message: String,
    /// Per-backend errors folded into an aggregate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inner: Vec<ReplyError>,
}

impl ReplyError {
    pub fn new(kind: ReplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            inner: Vec::new(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ReplyErrorKind::NotSupported, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ReplyErrorKind::Connection, message)
    }

    pub fn routing_miss(message: impl Into<String>) -> Self {
        Self::new(ReplyErrorKind::RoutingMiss, message)
    }

    pub fn canceled() -> Self {
        Self::new(ReplyErrorKind::Canceled, "dispatch canceled")
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ReplyErrorKind::Rejected, message)
    }

    /// Fold several backend errors into one.
    pub fn aggregate(message: impl Into<String>, inner: Vec<ReplyError>) -> Self {
        Self {
            kind: ReplyErrorKind::Aggregate,
            message: message.into(),
            inner,
        }
    }

    pub fn is_not_supported(&self) -> bool {
        self.kind == ReplyErrorKind::NotSupported
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.inner.is_empty() {
            let inner: Vec<String> = self.inner.iter().map(ToString::to_string).collect();
            write!(f, " [{}]", inner.join("; "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ReplyError {}
