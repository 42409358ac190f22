//! Failover subscription state.
//!
//! A failover request goes to one backend at a time. When that backend
//! answers "not supported", it is excluded and the next candidate is
//! tried straight away. Once the caller unsubscribes the entry is gone
//! and nothing can bring it back.

use crate::error::{RoutingError, RoutingResult};
use basket_core::{AdapterId, DataKind, Message, TransactionId};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FailoverEntry {
    pub request: Message,
    /// Backend currently serving the request.
    pub current: Option<AdapterId>,
    /// Backends that answered "not supported".
    pub not_supported: HashSet<AdapterId>,
    pub attempts: u32,
}

impl FailoverEntry {
    /// Record an attempt on `adapter`.
    pub fn assign(&mut self, adapter: AdapterId) {
        self.current = Some(adapter);
        self.attempts += 1;
    }
}

#[derive(Default)]
pub struct SubscriptionRoutingState {
    entries: DashMap<TransactionId, FailoverEntry>,
}

impl SubscriptionRoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start routing a failover request.
    ///
    /// Returns `false` if the transaction is already being routed; the
    /// existing entry is left alone.
    pub fn begin(&self, transaction_id: TransactionId, request: &Message) -> bool {
        let mut created = false;
        self.entries.entry(transaction_id).or_insert_with(|| {
            created = true;
            FailoverEntry {
                request: request.clone(),
                current: None,
                not_supported: HashSet::new(),
                attempts: 0,
            }
        });
        if !created {
            debug!(tx = %transaction_id, "Failover request already routed");
        }
        created
    }

    /// Exclusive access to a live entry for the next attempt.
    ///
    /// `None` once the request has finished or was unsubscribed. Other
    /// calls touching the same entry wait while the guard is held.
    pub fn resume(
        &self,
        transaction_id: TransactionId,
    ) -> Option<RefMut<'_, TransactionId, FailoverEntry>> {
        self.entries.get_mut(&transaction_id)
    }

    /// Backends that declined the request so far.
    pub fn excluded(&self, transaction_id: TransactionId) -> HashSet<AdapterId> {
        self.entries
            .get(&transaction_id)
            .map(|e| e.not_supported.clone())
            .unwrap_or_default()
    }

    /// Record an attempt outside a `resume` guard.
    pub fn set_current(&self, transaction_id: TransactionId, adapter: AdapterId) {
        if let Some(mut entry) = self.entries.get_mut(&transaction_id) {
            entry.assign(adapter);
        }
    }

    /// Backend serving the request now, if any.
    pub fn current(&self, transaction_id: TransactionId) -> Option<AdapterId> {
        self.entries.get(&transaction_id).and_then(|e| e.current)
    }

    /// Backends tried so far, counting the current one.
    pub fn attempts(&self, transaction_id: TransactionId) -> u32 {
        self.entries
            .get(&transaction_id)
            .map_or(0, |e| e.attempts)
    }

    /// Data kind of the routed request, for metric labels.
    pub fn data_kind(&self, transaction_id: TransactionId) -> Option<DataKind> {
        self.entries
            .get(&transaction_id)
            .and_then(|e| e.request.data_kind())
    }

    /// Exclude `adapter` after it declined the request.
    ///
    /// Returns `true` when the caller should try the next candidate.
    /// Declines for unknown transactions, and duplicate or stale declines
    /// from a backend no longer serving the request, are ignored. The
    /// serving backend being excluded already is a routing bug.
    pub fn mark_not_supported(
        &self,
        transaction_id: TransactionId,
        adapter: AdapterId,
    ) -> RoutingResult<bool> {
        let Some(mut entry) = self.entries.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if entry.current != Some(adapter) {
            let reason = if entry.not_supported.contains(&adapter) {
                "duplicate"
            } else {
                "stale"
            };
            debug!(
                tx = %transaction_id,
                %adapter,
                current = ?entry.current,
                reason,
                "Ignoring failover decline"
            );
            return Ok(false);
        }
        if !entry.not_supported.insert(adapter) {
            return Err(RoutingError::invariant(format!(
                "{adapter} serves {transaction_id} after declining it"
            )));
        }
        entry.current = None;
        debug!(
            tx = %transaction_id,
            %adapter,
            excluded = entry.not_supported.len(),
            "Failover candidate declined"
        );
        Ok(true)
    }

    /// Stop routing the request, returning its final entry.
    pub fn finish(&self, transaction_id: TransactionId) -> Option<FailoverEntry> {
        self.entries.remove(&transaction_id).map(|(_, e)| e)
    }

    pub fn contains(&self, transaction_id: TransactionId) -> bool {
        self.entries.contains_key(&transaction_id)
    }

    /// Requests currently served by `adapter`.
    pub fn entries_on(&self, adapter: AdapterId) -> Vec<TransactionId> {
        self.entries
            .iter()
            .filter(|e| e.current == Some(adapter))
            .map(|e| *e.key())
            .collect()
    }

    /// Live failover subscriptions for a data kind.
    pub fn subscribers(&self, data_kind: DataKind) -> Vec<(TransactionId, Option<AdapterId>)> {
        self.entries
            .iter()
            .filter(|e| e.request.data_kind() == Some(data_kind) && e.request.is_subscribe())
            .map(|e| (*e.key(), e.current))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
