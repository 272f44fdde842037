//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is a generic publish/subscribe hub. It is designed to be
//! shared via `Arc<EventBus<E>>` (or embedded in a component that is
//! itself behind an `Arc`) so any number of observers can watch batch and
//! pool activity without the producer knowing about them.

use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published event.
///
/// # Usage
///
/// ```rust
/// use pixelmill_events::EventBus;
///
/// #[derive(Debug, Clone)]
/// enum Ping { One }
///
/// let bus: EventBus<Ping> = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(Ping::One);
/// ```
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// observation is optional by design.
    pub fn publish(&self, event: E) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Started { id: u32 },
        Finished { id: u32 },
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(TestEvent::Started { id: 7 });

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received, TestEvent::Started { id: 7 });
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(TestEvent::Finished { id: 1 });

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");

        assert_eq!(e1, TestEvent::Finished { id: 1 });
        assert_eq!(e2, TestEvent::Finished { id: 1 });
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus: EventBus<TestEvent> = EventBus::default();
        // No subscribers — this must not panic.
        bus.publish(TestEvent::Started { id: 0 });
    }

    #[tokio::test]
    async fn subscriber_count_tracks_subscriptions() {
        let bus: EventBus<TestEvent> = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);

        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus: EventBus<TestEvent> = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(TestEvent::Started { id: 1 });
        bus.publish(TestEvent::Finished { id: 1 });

        assert_eq!(rx.recv().await.unwrap(), TestEvent::Started { id: 1 });
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Finished { id: 1 });
    }
}
