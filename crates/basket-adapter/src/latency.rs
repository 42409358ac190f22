//! Order latency stage.
//!
//! Stamps transaction reports with the time elapsed since the order
//! request that produced them crossed this stage.

use crate::stage::{Inbound, Outbound, Stage, StageKind};
use basket_core::{ExecutionKind, Message, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

#[derive(Default)]
pub struct LatencyStage {
    in_flight: Mutex<HashMap<TransactionId, Instant>>,
}

impl LatencyStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl Stage for LatencyStage {
    fn name(&self) -> &str {
        "latency"
    }

    fn kind(&self) -> StageKind {
        StageKind::Latency
    }

    fn on_inbound(&self, message: Message) -> Inbound {
        match &message {
            Message::OrderRegister(_) | Message::OrderCancel(_) | Message::OrderReplace(_) => {
                if let Some(tx) = message.transaction_id() {
                    self.in_flight.lock().insert(tx, Instant::now());
                }
            }
            Message::Reset(_) => self.in_flight.lock().clear(),
            _ => {}
        }
        Inbound::Forward(message)
    }

    fn on_outbound(&self, mut message: Message) -> Outbound {
        if let Message::Execution(execution) = &mut message {
            if execution.kind == ExecutionKind::Transaction {
                let sent = execution
                    .ids
                    .original_transaction_id
                    .and_then(|tx| self.in_flight.lock().remove(&tx));
                if let Some(sent) = sent {
                    let latency_us = u64::try_from(sent.elapsed().as_micros()).unwrap_or(u64::MAX);
                    debug!(latency_us, "Order round trip");
                    execution.latency_us = Some(latency_us);
                }
            }
        }
        Outbound::Forward(message)
    }
}
