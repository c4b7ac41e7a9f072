//! Message bus for pipeline events
//!
//! Publish/subscribe over bounded `tokio::mpsc` channels. Subscribers pick a
//! specific `EventType` or `EventType::All`. Publishing never waits: when a
//! subscriber's buffer is full the event is dropped for that subscriber, and
//! subscribers whose receiver was dropped are pruned.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    MessageReceived,
    MessageResponded,
    MessageFailed,
    HandlerFaulted,
    ClassificationDegraded,
    /// Subscribe to all event types
    All,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A message entered the pipeline
    MessageReceived { user_id: String, message_id: String },
    /// A reply was produced; `handler` is the responder
    MessageResponded {
        user_id: String,
        message_id: String,
        handler: String,
    },
    /// The message ended in the `Failed` stage; `stage` is the last stage
    /// it reached
    MessageFailed {
        user_id: String,
        message_id: String,
        stage: String,
        error: String,
    },
    /// A handler faulted, panicked, or timed out
    HandlerFaulted {
        handler: String,
        message_id: String,
        reason: String,
    },
    /// Classification fell back to the empty result
    ClassificationDegraded { message_id: String, reason: String },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::MessageReceived { .. } => EventType::MessageReceived,
            Event::MessageResponded { .. } => EventType::MessageResponded,
            Event::MessageFailed { .. } => EventType::MessageFailed,
            Event::HandlerFaulted { .. } => EventType::HandlerFaulted,
            Event::ClassificationDegraded { .. } => EventType::ClassificationDegraded,
        }
    }
}

/// Message bus for pub/sub communication between components
#[derive(Clone, Default)]
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to its subscribers and to `All` subscribers
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Event subscriber lagging, dropped {:?}", event_type);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers, across all event types
    pub async fn subscriber_count(&self) -> usize {
        self.channels.lock().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(handler: &str) -> Event {
        Event::HandlerFaulted {
            handler: handler.to_string(),
            message_id: "m1".to_string(),
            reason: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::HandlerFaulted).await;

        bus.publish(fault("weather")).await;

        match rx.recv().await.unwrap() {
            Event::HandlerFaulted { handler, .. } => assert_eq!(handler, "weather"),
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_subscribers_see_everything() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_received = bus.subscribe(EventType::MessageReceived).await;

        bus.publish(Event::MessageReceived {
            user_id: "u".to_string(),
            message_id: "m".to_string(),
        })
        .await;
        bus.publish(fault("weather")).await;

        assert_eq!(rx_all.recv().await.unwrap().event_type(), EventType::MessageReceived);
        assert_eq!(rx_all.recv().await.unwrap().event_type(), EventType::HandlerFaulted);
        assert_eq!(
            rx_received.recv().await.unwrap().event_type(),
            EventType::MessageReceived
        );
        assert!(rx_received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_publisher() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::HandlerFaulted).await;

        for _ in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(fault("noisy")).await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::MessageFailed).await;
        assert_eq!(bus.subscriber_count().await, 1);
        drop(rx);

        bus.publish(Event::MessageFailed {
            user_id: "u".to_string(),
            message_id: "m".to_string(),
            stage: "received".to_string(),
            error: "store".to_string(),
        })
        .await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
