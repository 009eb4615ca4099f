//! Durable Message Store
//!
//! The persistence boundary for topic logs. The pipeline always writes
//! whole-collection snapshots: every durable sync replaces the topic's stored
//! collection atomically, so the store never needs to understand individual
//! message edits. The on-disk encoding is the implementor's business.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::messages::{Message, TopicId};

/// Errors surfaced by a durable store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium rejected or lost the operation
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Stored payload could not be decoded
    #[error("corrupt stored payload: {0}")]
    Corrupt(String),
}

/// Durable, ordered message collections keyed by topic
///
/// Implementations must make `put` atomic per topic: readers see either the
/// previous collection or the new one, never a partial mix.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Load a topic's full collection in persisted order
    async fn get(&self, topic: TopicId) -> Result<Vec<Message>, StoreError>;

    /// Replace a topic's full collection
    async fn put(&self, topic: TopicId, messages: Vec<Message>) -> Result<(), StoreError>;

    /// Delete a topic's collection entirely
    async fn delete(&self, topic: TopicId) -> Result<(), StoreError>;
}

/// In-memory store
///
/// The reference implementation: a concurrent map of topic snapshots. Useful
/// as the default for embedders that persist elsewhere, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    topics: DashMap<TopicId, Vec<Message>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with a stored collection
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get(&self, topic: TopicId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .topics
            .get(&topic)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn put(&self, topic: TopicId, messages: Vec<Message>) -> Result<(), StoreError> {
        self.topics.insert(topic, messages);
        Ok(())
    }

    async fn delete(&self, topic: TopicId) -> Result<(), StoreError> {
        self.topics.remove(&topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_topic_is_empty() {
        let store = MemoryStore::new();
        let loaded = store.get(TopicId::new()).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_put_replaces_whole_collection() {
        let store = MemoryStore::new();
        let topic = TopicId::new();

        let first = vec![Message::user(topic, "one"), Message::user(topic, "two")];
        store.put(topic, first).await.unwrap();
        assert_eq!(store.get(topic).await.unwrap().len(), 2);

        let second = vec![Message::user(topic, "only")];
        store.put(topic, second).await.unwrap();

        let loaded = store.get(topic).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "only");
    }

    #[tokio::test]
    async fn test_delete_removes_topic() {
        let store = MemoryStore::new();
        let topic = TopicId::new();

        store
            .put(topic, vec![Message::user(topic, "hello")])
            .await
            .unwrap();
        assert_eq!(store.topic_count(), 1);

        store.delete(topic).await.unwrap();
        assert_eq!(store.topic_count(), 0);
        assert!(store.get(topic).await.unwrap().is_empty());
    }
}
