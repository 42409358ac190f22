//! Heartbeat tracking for backend connections.
//!
//! Monitors connection health by tracking ping/pong timing and
//! message activity. The stage pings an idle backend and reports a
//! connection error when a ping goes unanswered.

use crate::stage::{Outbound, Stage, StageKind, Tick};
use basket_core::{DisconnectMessage, Message, ReplyError, TimeMessage, TransactionId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Ping ids live far above caller-issued ids.
const PING_ID_BASE: u64 = 1 << 62;

/// Ping/pong and activity timestamps for one connection.
pub struct HeartbeatTracker {
    /// Idle time before a ping is sent.
    interval_ms: u64,
    /// How long to wait for a pong.
    timeout_ms: u64,
    last_ping: RwLock<Option<DateTime<Utc>>>,
    last_pong: RwLock<Option<DateTime<Utc>>>,
    /// Last message received (any message).
    last_message: RwLock<DateTime<Utc>>,
    waiting_for_pong: RwLock<bool>,
}

impl HeartbeatTracker {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            last_ping: RwLock::new(None),
            last_pong: RwLock::new(None),
            last_message: RwLock::new(Utc::now()),
            waiting_for_pong: RwLock::new(false),
        }
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&self) {
        *self.last_ping.write() = None;
        *self.last_pong.write() = None;
        *self.last_message.write() = Utc::now();
        *self.waiting_for_pong.write() = false;
    }

    pub fn record_ping(&self) {
        let now = Utc::now();
        *self.last_ping.write() = Some(now);
        *self.waiting_for_pong.write() = true;
        debug!(time = %now, "Recorded ping");
    }

    pub fn record_pong(&self) {
        let now = Utc::now();
        *self.last_pong.write() = Some(now);
        *self.waiting_for_pong.write() = false;

        if let Some(ping_time) = *self.last_ping.read() {
            let rtt_ms = (now - ping_time).num_milliseconds();
            debug!(rtt_ms, "Received pong");
        }
    }

    pub fn record_message(&self) {
        *self.last_message.write() = Utc::now();
    }

    /// A ping is outstanding for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        if !*self.waiting_for_pong.read() {
            return false;
        }

        if let Some(ping_time) = *self.last_ping.read() {
            let elapsed_ms = (Utc::now() - ping_time).num_milliseconds();
            return elapsed_ms > i64::try_from(self.timeout_ms).unwrap_or(i64::MAX);
        }

        false
    }

    pub fn time_since_last_message_ms(&self) -> i64 {
        (Utc::now() - *self.last_message.read()).num_milliseconds()
    }

    /// Idle long enough to ping, and no ping outstanding.
    pub fn should_send_heartbeat(&self) -> bool {
        if *self.waiting_for_pong.read() {
            return false;
        }
        self.time_since_last_message_ms() >= i64::try_from(self.interval_ms).unwrap_or(i64::MAX)
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            last_ping: *self.last_ping.read(),
            last_pong: *self.last_pong.read(),
            last_message: *self.last_message.read(),
            waiting_for_pong: *self.waiting_for_pong.read(),
            time_since_last_message_ms: self.time_since_last_message_ms(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub last_message: DateTime<Utc>,
    pub waiting_for_pong: bool,
    pub time_since_last_message_ms: i64,
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Innermost pipeline stage keeping a backend's liveness in check.
pub struct HeartbeatStage {
    tracker: HeartbeatTracker,
    connected: AtomicBool,
    next_ping: AtomicU64,
    outstanding_ping: RwLock<Option<TransactionId>>,
}

impl HeartbeatStage {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            tracker: HeartbeatTracker::new(saturating_millis(interval), saturating_millis(timeout)),
            connected: AtomicBool::new(false),
            next_ping: AtomicU64::new(PING_ID_BASE),
            outstanding_ping: RwLock::new(None),
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.tracker.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Stage for HeartbeatStage {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn kind(&self) -> StageKind {
        StageKind::Heartbeat
    }

    fn on_outbound(&self, message: Message) -> Outbound {
        self.tracker.record_message();
        match &message {
            Message::Connect(m) if m.error.is_none() => {
                self.tracker.reset();
                self.connected.store(true, Ordering::SeqCst);
            }
            Message::Disconnect(_) => {
                self.connected.store(false, Ordering::SeqCst);
                *self.outstanding_ping.write() = None;
            }
            Message::Time(m) => {
                let mut outstanding = self.outstanding_ping.write();
                if m.original_transaction_id.is_some() && m.original_transaction_id == *outstanding
                {
                    *outstanding = None;
                    self.tracker.record_pong();
                    return Outbound::Drop;
                }
            }
            _ => {}
        }
        Outbound::Forward(message)
    }

    fn on_tick(&self) -> Tick {
        let mut tick = Tick::default();
        if !self.is_connected() {
            return tick;
        }

        if self.tracker.is_timed_out() {
            warn!(
                since_last_message_ms = self.tracker.time_since_last_message_ms(),
                "Heartbeat timed out"
            );
            self.connected.store(false, Ordering::SeqCst);
            *self.outstanding_ping.write() = None;
            tick.outward.push(Message::Disconnect(DisconnectMessage {
                error: Some(ReplyError::connection("heartbeat timeout")),
            }));
        } else if self.tracker.should_send_heartbeat() {
            let id = TransactionId::new(self.next_ping.fetch_add(1, Ordering::SeqCst));
            *self.outstanding_ping.write() = Some(id);
            self.tracker.record_ping();
            tick.inward.push(Message::Time(TimeMessage {
                transaction_id: Some(id),
                original_transaction_id: None,
                server_time: Utc::now(),
            }));
        }
        tick
    }
}
