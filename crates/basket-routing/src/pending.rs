//! Pending message buffers.
//!
//! Per-connection queues for messages sent while a backend is still
//! connecting, plus one queue for requests that arrived before any
//! backend could take them.

use basket_core::{AdapterId, Message, TransactionId};
use basket_telemetry::Metrics;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

const UNROUTED_QUEUE: &str = "unrouted";
const CONNECTING_QUEUE: &str = "connecting";

pub struct PendingMessageBuffer {
    by_adapter: DashMap<AdapterId, VecDeque<Message>>,
    unrouted: Mutex<VecDeque<Message>>,
}

impl PendingMessageBuffer {
    pub fn new() -> Self {
        Self {
            by_adapter: DashMap::new(),
            unrouted: Mutex::new(VecDeque::new()),
        }
    }

    /// Exclusive access to one connection's queue.
    ///
    /// Holding the guard serializes buffering against the flush that
    /// follows a successful connect. Do not call other methods of this
    /// buffer while holding it.
    pub fn queue(&self, adapter: AdapterId) -> RefMut<'_, AdapterId, VecDeque<Message>> {
        self.by_adapter.entry(adapter).or_default()
    }

    /// Drain one connection's queue, oldest first.
    pub fn take(&self, adapter: AdapterId) -> Vec<Message> {
        let drained: Vec<Message> = self
            .by_adapter
            .remove(&adapter)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default();
        self.report_connecting();
        drained
    }

    pub fn connecting_len(&self) -> usize {
        self.by_adapter.iter().map(|q| q.len()).sum()
    }

    /// Park a request nothing can take yet.
    pub fn park(&self, message: Message) {
        let len = {
            let mut unrouted = self.unrouted.lock();
            unrouted.push_back(message);
            unrouted.len()
        };
        debug!(len, "Parked unrouted request");
        Metrics::pending_set(UNROUTED_QUEUE, len);
    }

    /// Drain every parked request, oldest first.
    pub fn take_unrouted(&self) -> Vec<Message> {
        let drained: Vec<Message> = self.unrouted.lock().drain(..).collect();
        Metrics::pending_set(UNROUTED_QUEUE, 0);
        drained
    }

    /// Remove a parked request by its transaction id.
    pub fn remove_unrouted(&self, transaction_id: TransactionId) -> Option<Message> {
        let mut unrouted = self.unrouted.lock();
        let index = unrouted
            .iter()
            .position(|m| m.transaction_id() == Some(transaction_id))?;
        let removed = unrouted.remove(index);
        Metrics::pending_set(UNROUTED_QUEUE, unrouted.len());
        removed
    }

    pub fn unrouted_len(&self) -> usize {
        self.unrouted.lock().len()
    }

    pub fn clear(&self) {
        self.by_adapter.clear();
        self.unrouted.lock().clear();
        Metrics::pending_set(UNROUTED_QUEUE, 0);
        Metrics::pending_set(CONNECTING_QUEUE, 0);
    }

    /// Update the gauge after a queue guard was released.
    pub fn report_connecting(&self) {
        Metrics::pending_set(CONNECTING_QUEUE, self.connecting_len());
    }
}

impl Default for PendingMessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
