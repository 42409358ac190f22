//! Offline buffering stage.
//!
//! Holds requests while the backend is not connected and replays them,
//! in arrival order, once it reports a successful connect.

use crate::stage::{Inbound, Outbound, Stage, StageKind};
use basket_core::Message;
use parking_lot::Mutex;
use tracing::debug;

pub struct OfflineStage {
    state: Mutex<OfflineState>,
}

#[derive(Default)]
struct OfflineState {
    online: bool,
    held: Vec<Message>,
}

impl OfflineStage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OfflineState::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }
}

impl Default for OfflineStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for OfflineStage {
    fn name(&self) -> &str {
        "offline"
    }

    fn kind(&self) -> StageKind {
        StageKind::Offline
    }

    fn on_inbound(&self, message: Message) -> Inbound {
        let mut state = self.state.lock();
        match &message {
            Message::Reset(_) => {
                state.held.clear();
                Inbound::Forward(message)
            }
            Message::Connect(_) | Message::Disconnect(_) | Message::Time(_) => {
                Inbound::Forward(message)
            }
            _ if state.online => Inbound::Forward(message),
            _ => {
                debug!(kind = %message.kind(), "Holding message while offline");
                state.held.push(message);
                Inbound::Hold
            }
        }
    }

    fn on_outbound(&self, message: Message) -> Outbound {
        let mut state = self.state.lock();
        match &message {
            Message::Connect(m) if m.error.is_none() => {
                state.online = true;
                let resend = std::mem::take(&mut state.held);
                if resend.is_empty() {
                    Outbound::Forward(message)
                } else {
                    debug!(count = resend.len(), "Replaying held messages");
                    Outbound::Release { message, resend }
                }
            }
            Message::Disconnect(_) => {
                state.online = false;
                Outbound::Forward(message)
            }
            _ => Outbound::Forward(message),
        }
    }
}
