use tokio::sync::broadcast;

use crate::api::types::{QrRequestId, QrStatus, UserId};
use crate::ledger::BalanceSnapshot;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// State changes observable by an embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    SessionStarted { user_id: UserId },
    SessionEnded,
    BalanceChanged(Option<BalanceSnapshot>),
    PeersUpdated { count: usize },
    QrStatusChanged {
        request_id: QrRequestId,
        status: QrStatus,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; nobody listening is not an error.
    pub fn emit(&self, event: CoordinatorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }
}
