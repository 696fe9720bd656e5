//! Event system for session lifecycle notifications
//!
//! The registry reaper subscribes here to drop terminal sessions as soon as
//! they end instead of waiting for the periodic sweep.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting system events
///
/// Subscribers that fall too far behind receive `Lagged` and miss events.
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SystemEvent::SessionRemoved {
            session_id: "s1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::SessionRemoved { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::ConfigChanged {
            key: "cameras".to_string(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), SystemEvent::ConfigChanged { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), SystemEvent::ConfigChanged { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SystemEvent::SessionRemoved {
            session_id: "s1".to_string(),
        });
    }
}
