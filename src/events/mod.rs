//! Event system for outbound session notifications
//!
//! This module provides the event bus the session controller publishes
//! engine-originated notifications on.

pub mod types;

pub use types::SessionEvent;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting session events
///
/// The event bus uses tokio's broadcast channel to distribute events
/// to multiple subscribers. Events are delivered to all active subscribers.
///
/// # Example
///
/// ```no_run
/// use cap_webrtc::events::{EventBus, SessionEvent};
///
/// let bus = EventBus::new();
///
/// // Subscribe to events
/// let mut rx = bus.subscribe();
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}: {:?}", event.event_name(), event);
///     }
/// });
///
/// // Publish an event
/// bus.publish(SessionEvent::ConnectionState {
///     state: "connected".to_string(),
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: SessionEvent) {
        // If no subscribers, send returns Err which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Returns a receiver that will receive all future events.
    /// The receiver uses a ring buffer, so if a subscriber falls too far
    /// behind, it will receive a `Lagged` error and miss some events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Publisher bound to one session generation
///
/// Engine callbacks hold one of these instead of the bus. Once the owning
/// session is stopped the generation moves on and late callbacks publish
/// nothing.
#[derive(Clone)]
pub struct EventSink {
    bus: Arc<EventBus>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl EventSink {
    pub fn new(bus: Arc<EventBus>, current: Arc<AtomicU64>, generation: u64) -> Self {
        Self {
            bus,
            current,
            generation,
        }
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub fn publish(&self, event: SessionEvent) {
        if self.is_live() {
            self.bus.publish(event);
        } else {
            trace!("Dropping {} from stale session", event.event_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ConnectionState {
            state: "connected".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::ConnectionState { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SessionEvent::DataChannelState {
            channel_id: "chat".to_string(),
            state: "open".to_string(),
        });

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();

        assert!(matches!(event1, SessionEvent::DataChannelState { .. }));
        assert!(matches!(event2, SessionEvent::DataChannelState { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Should not panic when publishing with no subscribers
        bus.publish(SessionEvent::ConnectionState {
            state: "closed".to_string(),
        });
    }

    #[test]
    fn test_stale_sink_is_silent() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let current = Arc::new(AtomicU64::new(1));
        let sink = EventSink::new(bus.clone(), current.clone(), 1);

        sink.publish(SessionEvent::ConnectionState {
            state: "connected".to_string(),
        });
        current.store(2, Ordering::SeqCst);
        sink.publish(SessionEvent::ConnectionState {
            state: "closed".to_string(),
        });

        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::ConnectionState { ref state }) if state == "connected"
        ));
        assert!(rx.try_recv().is_err());
    }
}
