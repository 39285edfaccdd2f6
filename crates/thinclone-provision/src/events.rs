//! Provisioning event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Session lifecycle events.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionEvent {
    /// Session started.
    SessionStarted {
        session_id: String,
        pool: String,
        clone: String,
        port: u16,
        timestamp: i64,
    },
    /// Session moved to a new clone.
    SessionReset {
        session_id: String,
        pool: String,
        snapshot_id: String,
        timestamp: i64,
    },
    /// Session stopped.
    SessionStopped {
        session_id: String,
        port: u16,
        timestamp: i64,
    },
    /// Port bookkeeping reconciled with the host.
    PortPoolRevised {
        bound: usize,
        freed: usize,
        timestamp: i64,
    },
}

/// Event bus for provisioning events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProvisionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: ProvisionEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ProvisionEvent::SessionStopped {
            session_id: "s1".to_string(),
            port: 6000,
            timestamp: 0,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            ProvisionEvent::SessionStopped { port: 6000, .. }
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        EventBus::new().publish(ProvisionEvent::PortPoolRevised {
            bound: 0,
            freed: 0,
            timestamp: 0,
        });
    }
}
