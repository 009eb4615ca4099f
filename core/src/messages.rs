//! Message Data Model
//!
//! Core record types for the pipeline: topics, messages, roles, and statuses.
//! This module defines the data structures; the pipeline handles orchestration.
//!
//! # Design Philosophy
//!
//! A `Message` is immutable by convention once committed. While a reply is
//! being streamed it is mutated only through the streaming coordinator's
//! explicit update path; everything auxiliary the core does not interpret
//! (`files`, `mentions`, `usage`, ...) is carried as opaque JSON and passed
//! through unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a topic (one conversation thread)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId(pub Uuid);

impl TopicId {
    /// Create a new unique topic ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TopicId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    /// User input
    User,
    /// Assistant reply
    Assistant,
}

/// Lifecycle status of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Request dispatched, no partial output yet
    Sending,
    /// Partial output is arriving
    Pending,
    /// Reply completed successfully
    Success,
    /// Reply failed
    Error,
    /// Reply was cancelled mid-stream; partial content is kept
    Paused,
}

impl MessageStatus {
    /// Whether the message is still being produced
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Sending | Self::Pending)
    }

    /// Whether this status ends the message lifecycle
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sending => "Sending",
            Self::Pending => "Pending",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Paused => "Paused",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A message in a topic's log
///
/// `created_at` is the sole ordering key for persistence; ties are broken by
/// insertion order inside [`crate::topic::TopicLog`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Owning topic
    pub topic_id: TopicId,
    /// Who sent this message
    pub role: MessageRole,
    /// For assistant messages, the user message this answers
    pub ask_id: Option<MessageId>,
    /// Current lifecycle status
    pub status: MessageStatus,
    /// Text payload; mutated incrementally while in progress
    pub content: String,
    /// Creation timestamp, the persistence ordering key
    pub created_at: DateTime<Utc>,
    /// Model that produced (or will produce) this message
    pub model: Option<String>,
    /// Attached files, passed through unchanged
    pub files: Option<Value>,
    /// Mentioned models/agents, passed through unchanged
    pub mentions: Option<Value>,
    /// Knowledge base references, passed through unchanged
    pub knowledge_base_ids: Option<Value>,
    /// Token usage reported by the completion source
    pub usage: Option<Value>,
    /// Failure detail when status is `Error`
    pub error: Option<String>,
}

impl Message {
    /// Create a committed user message
    #[must_use]
    pub fn user(topic_id: TopicId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            topic_id,
            role: MessageRole::User,
            ask_id: None,
            status: MessageStatus::Success,
            content: content.into(),
            created_at: Utc::now(),
            model: None,
            files: None,
            mentions: None,
            knowledge_base_ids: None,
            usage: None,
            error: None,
        }
    }

    /// Create an assistant placeholder answering `ask_id`
    ///
    /// The placeholder starts in `Sending` status with empty content and is
    /// filled by the streaming coordinator.
    #[must_use]
    pub fn assistant_placeholder(
        topic_id: TopicId,
        ask_id: MessageId,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            topic_id,
            role: MessageRole::Assistant,
            ask_id: Some(ask_id),
            status: MessageStatus::Sending,
            content: String::new(),
            created_at: Utc::now(),
            model: Some(model.into()),
            files: None,
            mentions: None,
            knowledge_base_ids: None,
            usage: None,
            error: None,
        }
    }

    /// Attach opaque file payload
    #[must_use]
    pub fn with_files(mut self, files: Value) -> Self {
        self.files = Some(files);
        self
    }

    /// Attach opaque mention payload
    #[must_use]
    pub fn with_mentions(mut self, mentions: Value) -> Self {
        self.mentions = Some(mentions);
        self
    }

    /// Attach knowledge base references
    #[must_use]
    pub fn with_knowledge_base_ids(mut self, ids: Value) -> Self {
        self.knowledge_base_ids = Some(ids);
        self
    }

    /// Whether the message is still being produced
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    /// Reset this message for a resend
    ///
    /// Identity (`id`, `ask_id`, `created_at`) is preserved so the eventual
    /// commit replaces this entry in place instead of duplicating it.
    pub fn reset_for_resend(&mut self, model: impl Into<String>) {
        self.content.clear();
        self.status = MessageStatus::Sending;
        self.model = Some(model.into());
        self.usage = None;
        self.error = None;
    }
}
