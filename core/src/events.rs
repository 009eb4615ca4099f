//! Pipeline Event Bus
//!
//! Fire-and-forget notifications about pipeline activity on a broadcast
//! channel. Embedders subscribe to drive UI updates; the pipeline never
//! waits for subscribers, and a bus with no subscribers drops events
//! silently.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::messages::{Message, TopicId};

/// Notification emitted by the pipeline
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// A user message entered a topic's log
    MessageSent {
        /// The committed user message
        message: Message,
    },
    /// Throttled flush of a topic's in-progress reply
    StreamUpdate {
        /// Current merged state of the streaming slot
        message: Message,
    },
    /// A terminal assistant message was committed to the log
    MessageCommitted {
        /// The committed message
        message: Message,
    },
    /// A topic completed its first exchange; a rename is suggested
    RenameSuggested {
        /// Topic to rename
        topic: TopicId,
        /// Suggested name, derived from the first user message
        name: String,
    },
    /// A recoverable failure was surfaced
    Error {
        /// Topic the failure belongs to
        topic: TopicId,
        /// Human-readable failure detail
        detail: String,
    },
}

/// Broadcast bus for [`PipelineEvent`]
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream` of events
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<PipelineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: PipelineEvent) {
        // Err means no subscribers; that is fine.
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let topic = TopicId::new();
        let message = Message::user(topic, "hello");
        bus.emit(PipelineEvent::MessageSent {
            message: message.clone(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::MessageSent { message: received } => {
                assert_eq!(received.id, message.id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(PipelineEvent::Error {
            topic: TopicId::new(),
            detail: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(8);
        bus.emit(PipelineEvent::RenameSuggested {
            topic: TopicId::new(),
            name: "early".to_string(),
        });

        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::RenameSuggested {
            topic: TopicId::new(),
            name: "late".to_string(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::RenameSuggested { name, .. } => assert_eq!(name, "late"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
