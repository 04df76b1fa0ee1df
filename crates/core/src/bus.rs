use crate::types::{Group, Message, SessionStatus};
use tokio::sync::broadcast;

/// Per-session events fanned out to external subscribers (WebSocket rooms).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Qr {
        session_id: String,
        qr: String,
    },
    ConnectionStatus {
        session_id: String,
        status: SessionStatus,
        phone_number: Option<String>,
    },
    Message {
        session_id: String,
        message: Message,
    },
    GroupUpdate {
        session_id: String,
        group: Group,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Qr { session_id, .. }
            | SessionEvent::ConnectionStatus { session_id, .. }
            | SessionEvent::Message { session_id, .. }
            | SessionEvent::GroupUpdate { session_id, .. } => session_id,
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish is best-effort: a send error only means there are no
    /// subscribers, and a slow subscriber lags without blocking us.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
