//! Correlation identifiers.
//!
//! `TransactionId` ties every reply to the request it answers. The router
//! mints fresh ids for the per-connection copies of a request, so the
//! generator is shared between the caller and the router through an `Arc`.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-unique request identifier.
///
/// Zero is never issued by [`IdGenerator`] and is rejected when parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Create from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Whether this id could have been issued by a generator.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let value: u64 = s
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidTransactionId(s.to_string()))?;
        if value == 0 {
            return Err(CoreError::InvalidTransactionId(s.to_string()));
        }
        Ok(Self(value))
    }
}

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Thread-safe monotonic transaction id generator.
///
/// # Guarantees
/// - Ids are strictly increasing across all threads
/// - Zero is never issued
#[derive(Debug)]
pub struct IdGenerator {
    /// Last issued id.
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first id is `first` (clamped to 1).
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: AtomicU64::new(first.max(1) - 1),
        }
    }

    /// Issue the next id.
    pub fn next_id(&self) -> TransactionId {
        TransactionId(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Last issued id, if any.
    pub fn last(&self) -> Option<TransactionId> {
        match self.counter.load(Ordering::SeqCst) {
            0 => None,
            value => Some(TransactionId(value)),
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(Uuid);

impl AdapterId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AdapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
