//! Topic Message Logs
//!
//! The per-topic ordered message log and the process-wide registry of logs.
//!
//! # Design Philosophy
//!
//! The in-memory log is the source of truth for a running session; the
//! durable store only ever receives whole-collection snapshots of it.
//! Ordering is maintained on insert (ascending `created_at`, ties broken by
//! insertion order), so readers never sort. Each topic carries an epoch
//! counter that is bumped by `clear`; streamed commits started before the
//! clear are rejected by comparing epochs.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::messages::{Message, MessageId, MessageRole, TopicId};

/// Ordered message log for one topic
///
/// Invariants: entries are sorted ascending by `created_at` with ties in
/// insertion order, and no two entries share an id.
#[derive(Clone, Debug, Default)]
pub struct TopicLog {
    messages: Vec<Message>,
}

impl TopicLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in the log
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages in persisted order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Position of a message by id
    #[must_use]
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Get a message by id
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Insert a message, or replace it in place when the id already exists
    ///
    /// New entries land after every existing entry with an equal or earlier
    /// `created_at`, which preserves insertion order among ties. Replacement
    /// keeps the original position so commits never reorder the log.
    pub fn upsert(&mut self, message: Message) {
        if let Some(pos) = self.position(message.id) {
            self.messages[pos] = message;
            return;
        }

        let pos = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(pos, message);
    }

    /// Apply a mutation to a message by id
    ///
    /// Returns false if the message is not in the log.
    pub fn update<F>(&mut self, id: MessageId, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    /// Remove a message by id
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let pos = self.position(id)?;
        Some(self.messages.remove(pos))
    }

    /// Remove all messages
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// First assistant message answering the given user message
    #[must_use]
    pub fn assistant_for(&self, user_id: MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::Assistant && m.ask_id == Some(user_id))
    }

    /// Outgoing history for a completion request
    ///
    /// Everything strictly before the assistant placeholder, with in-progress
    /// messages excluded. When the placeholder is missing the whole filtered
    /// log is returned.
    #[must_use]
    pub fn history_before(&self, assistant_id: MessageId) -> Vec<Message> {
        let end = self.position(assistant_id).unwrap_or(self.messages.len());
        self.messages[..end]
            .iter()
            .filter(|m| !m.is_in_progress())
            .cloned()
            .collect()
    }
}

/// Per-topic log state guarded by one lock
#[derive(Debug, Default)]
struct TopicEntry {
    log: TopicLog,
    epoch: u64,
}

/// Process-wide registry of topic logs
///
/// Entries are created lazily on first access. The lock around each entry is
/// a short-critical-section `parking_lot::Mutex`; it is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct TopicLogs {
    inner: DashMap<TopicId, Arc<Mutex<TopicEntry>>>,
}

impl TopicLogs {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, topic: TopicId) -> Arc<Mutex<TopicEntry>> {
        self.inner
            .entry(topic)
            .or_insert_with(|| Arc::new(Mutex::new(TopicEntry::default())))
            .clone()
    }

    /// Insert or replace a message in a topic's log
    pub fn upsert(&self, topic: TopicId, message: Message) {
        self.entry(topic).lock().log.upsert(message);
    }

    /// Apply a mutation to a message; returns false if absent
    pub fn update<F>(&self, topic: TopicId, id: MessageId, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        self.entry(topic).lock().log.update(id, f)
    }

    /// Get a message by id
    #[must_use]
    pub fn get(&self, topic: TopicId, id: MessageId) -> Option<Message> {
        self.entry(topic).lock().log.get(id).cloned()
    }

    /// First assistant message answering the given user message
    #[must_use]
    pub fn assistant_for(&self, topic: TopicId, user_id: MessageId) -> Option<Message> {
        self.entry(topic).lock().log.assistant_for(user_id).cloned()
    }

    /// Outgoing history strictly before the given assistant placeholder
    #[must_use]
    pub fn history_before(&self, topic: TopicId, assistant_id: MessageId) -> Vec<Message> {
        self.entry(topic).lock().log.history_before(assistant_id)
    }

    /// Whole-log snapshot in persisted order
    #[must_use]
    pub fn snapshot(&self, topic: TopicId) -> Vec<Message> {
        self.entry(topic).lock().log.messages().to_vec()
    }

    /// Number of messages in a topic's log
    #[must_use]
    pub fn len(&self, topic: TopicId) -> usize {
        self.entry(topic).lock().log.len()
    }

    /// Whether a topic's log is empty
    #[must_use]
    pub fn is_empty(&self, topic: TopicId) -> bool {
        self.len(topic) == 0
    }

    /// Current clear-epoch for a topic
    #[must_use]
    pub fn epoch(&self, topic: TopicId) -> u64 {
        self.entry(topic).lock().epoch
    }

    /// Clear a topic's log and advance its epoch
    ///
    /// Commits opened against the previous epoch are rejected afterwards.
    pub fn clear(&self, topic: TopicId) {
        let entry = self.entry(topic);
        let mut guard = entry.lock();
        guard.log.clear();
        guard.epoch += 1;
        tracing::debug!(topic = %topic, epoch = guard.epoch, "Cleared topic log");
    }
}
