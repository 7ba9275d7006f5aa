//! Events surfaced by the agent client to any number of subscribers.

use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A request initiated by the agent. `auto_approved` is false when the
    /// client answered with "method not found".
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
        auto_approved: bool,
    },
    Stderr(String),
    ProtocolError(String),
    Exited {
        reason: String,
    },
}

/// Fan-out channel for [`AgentEvent`]s. Emitting with no subscribers is not
/// an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(AgentEvent::Stderr("x".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(AgentEvent::Exited {
            reason: "eof".into(),
        });
        assert!(matches!(a.recv().await.unwrap(), AgentEvent::Exited { .. }));
        assert!(matches!(b.recv().await.unwrap(), AgentEvent::Exited { .. }));
    }
}
