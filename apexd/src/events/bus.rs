//! Event bus - broadcast pub/sub for daemon events
//!
//! Components emit, consumers subscribe. The channel is bounded: a slow
//! subscriber lags and loses the oldest events rather than stalling the
//! emitter. Emission is fire-and-forget.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::Event;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Central broadcast bus for daemon activity
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a bus with the default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers.
    ///
    /// Send errors (no subscribers) are ignored; a full channel drops the
    /// oldest buffered events for lagging receivers.
    pub fn emit(&self, event: Event) {
        debug!(event_type = event.event_type(), task_id = ?event.task_id(), "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create a shared event bus
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(Event::DaemonStarted {
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(Event::TaskCreated {
            task_id: "t-1".into(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "task:created");
        assert_eq!(event.task_id(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_subscribers_observe_emission_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();

        let now = Utc::now();
        bus.emit(Event::TaskCreated {
            task_id: "t-1".into(),
            timestamp: now,
        });
        bus.emit(Event::TaskStageChanged {
            task_id: "t-1".into(),
            stage: "planning".into(),
            stage_index: 0,
            timestamp: now,
        });
        bus.emit(Event::TaskCompleted {
            task_id: "t-1".into(),
            timestamp: now,
        });

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type().to_string());
        }
        assert_eq!(seen, vec!["task:created", "task:stage-changed", "task:completed"]);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(Event::DaemonStarted {
            timestamp: Utc::now(),
        });

        assert_eq!(rx1.recv().await.unwrap().event_type(), "daemon:started");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "daemon:started");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_oldest_and_continues() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.emit(Event::TaskCreated {
                task_id: format!("t-{}", i),
                timestamp: Utc::now(),
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert!(missed > 0);
                // the stream keeps delivering after the lag
                let event = rx.recv().await.unwrap();
                assert_eq!(event.event_type(), "task:created");
            }
            Ok(event) => assert_eq!(event.event_type(), "task:created"),
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_try_recv_empty_after_drain() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(Event::DaemonStopped {
            timestamp: Utc::now(),
        });
        rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
