//! Conversation Pipeline
//!
//! The orchestrator tying the pieces together: topic logs, per-topic queues,
//! the streaming coordinator, the abort registry, the durable store, and the
//! completion source.
//!
//! # Architecture
//!
//! ```text
//!   send / resend                cancel            clear_topic
//!        │                         │                    │
//!        ▼                         ▼                    ▼
//!   TopicLogs ◄──── commit ── AbortRegistry      TopicQueues.clear
//!        │                         │              TopicLogs.clear (epoch++)
//!        ▼                         ▼              MessageStore.delete
//!   TopicQueues ──► unit ──► CompletionSource
//!                    │             │
//!                    ▼             ▼ partials
//!             StreamingCoordinator ──► EventBus (throttled StreamUpdate)
//! ```
//!
//! Every completion runs as a queued unit on its topic, so a topic never has
//! two requests in flight while unrelated topics proceed concurrently. The
//! in-memory log is the session's source of truth; the durable store receives
//! whole-topic snapshots after every mutation and its failures are surfaced
//! without reverting memory.

use std::sync::Arc;

use serde_json::Value;

use crate::abort::AbortRegistry;
use crate::completion::{
    CancelSignal, CompletionPartial, CompletionRequest, CompletionSource, ParticipantConfig,
};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::messages::{Message, MessageId, MessageRole, MessageStatus, TopicId};
use crate::queue::{TopicQueues, UnitHandle};
use crate::store::MessageStore;
use crate::streaming::StreamingCoordinator;
use crate::topic::TopicLogs;

/// Longest rename suggestion derived from a first message
const MAX_SUGGESTED_NAME_CHARS: usize = 40;

/// Optional payload attached to an outgoing user message
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Attached files, passed through unchanged
    pub files: Option<Value>,
    /// Mentioned models/agents, passed through unchanged
    pub mentions: Option<Value>,
    /// Knowledge base references, passed through unchanged
    pub knowledge_base_ids: Option<Value>,
}

impl SendOptions {
    /// Empty options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach files
    #[must_use]
    pub fn with_files(mut self, files: Value) -> Self {
        self.files = Some(files);
        self
    }

    /// Attach mentions
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
}

/// Identifiers and completion handle returned by `send`/`resend`
pub struct SendReceipt {
    /// The user message of the exchange
    pub user_id: MessageId,
    /// The assistant message being filled
    pub assistant_id: MessageId,
    /// Resolves when the queued completion finishes
    pub unit: UnitHandle,
}

struct Inner {
    config: PipelineConfig,
    logs: Arc<TopicLogs>,
    queues: TopicQueues,
    aborts: AbortRegistry,
    streaming: StreamingCoordinator,
    store: Arc<dyn MessageStore>,
    source: Arc<dyn CompletionSource>,
    bus: EventBus,
}

/// The conversation pipeline
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Create a pipeline over the given store and completion source
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn MessageStore>,
        source: Arc<dyn CompletionSource>,
    ) -> Self {
        let logs = Arc::new(TopicLogs::new());
        let bus = EventBus::new(config.event_capacity);
        let streaming = StreamingCoordinator::new(logs.clone(), bus.clone(), config.flush_interval);
        Self {
            inner: Arc::new(Inner {
                config,
                logs,
                queues: TopicQueues::new(),
                aborts: AbortRegistry::new(),
                streaming,
                store,
                source,
                bus,
            }),
        }
    }

    /// The pipeline's event bus
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Current in-memory log of a topic, in persisted order
    #[must_use]
    pub fn messages(&self, topic: TopicId) -> Vec<Message> {
        self.inner.logs.snapshot(topic)
    }

    /// Current merged state of a topic's in-flight reply, if any
    #[must_use]
    pub fn in_flight(&self, topic: TopicId) -> Option<Message> {
        self.inner.streaming.current(topic)
    }

    /// Load a topic's stored collection into the in-memory log
    ///
    /// Intended for session startup, before any send on the topic.
    ///
    /// # Errors
    ///
    /// Returns the store's error when loading fails.
    pub async fn hydrate(&self, topic: TopicId) -> Result<(), PipelineError> {
        let stored = self.inner.store.get(topic).await?;
        for message in stored {
            self.inner.logs.upsert(topic, message);
        }
        Ok(())
    }

    /// Send a user message and queue a streamed reply
    ///
    /// Commits the user message immediately, creates an assistant placeholder
    /// linked to it, syncs durably, and enqueues the completion on the
    /// topic's queue; the stream slot is opened when the queued unit starts,
    /// so an earlier request still streaming is never disturbed. Returns
    /// without waiting for the reply; join the receipt's unit handle or
    /// watch the event bus.
    pub async fn send(
        &self,
        topic: TopicId,
        content: impl Into<String>,
        participant: ParticipantConfig,
        options: SendOptions,
    ) -> SendReceipt {
        let mut user = Message::user(topic, content);
        user.files = options.files;
        user.mentions = options.mentions;
        user.knowledge_base_ids = options.knowledge_base_ids;
        let user_id = user.id;

        self.inner.logs.upsert(topic, user.clone());
        self.inner
            .bus
            .emit(PipelineEvent::MessageSent { message: user });

        let assistant = Message::assistant_placeholder(topic, user_id, &participant.model);
        let assistant_id = assistant.id;
        self.inner.logs.upsert(topic, assistant);

        persist(&self.inner, topic).await;

        let unit = self.enqueue_completion(topic, assistant_id, participant);
        SendReceipt {
            user_id,
            assistant_id,
            unit,
        }
    }

    /// Rerun a prior exchange
    ///
    /// `message_id` may name either side of the exchange. The default mode
    /// resets the existing assistant message in place, preserving its id and
    /// linkage so the commit replaces it; `is_mention_variant` instead
    /// creates a fresh assistant message answering the same user message, so
    /// several replies may share one `ask_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFound`] when the message, or an assistant
    /// message's linked user message, is missing from the log.
    pub async fn resend(
        &self,
        topic: TopicId,
        message_id: MessageId,
        participant: ParticipantConfig,
        is_mention_variant: bool,
    ) -> Result<SendReceipt, PipelineError> {
        let message = self
            .inner
            .logs
            .get(topic, message_id)
            .ok_or_else(|| PipelineError::NotFound(format!("message {message_id}")))?;

        let (user_id, assistant) = match message.role {
            MessageRole::User => {
                let existing = self.inner.logs.assistant_for(topic, message.id);
                let assistant = match existing {
                    Some(mut reply) if !is_mention_variant => {
                        reply.reset_for_resend(&participant.model);
                        reply
                    }
                    _ => Message::assistant_placeholder(topic, message.id, &participant.model),
                };
                (message.id, assistant)
            }
            MessageRole::Assistant => {
                let user_id = message.ask_id.ok_or_else(|| {
                    PipelineError::NotFound(format!("user message for reply {message_id}"))
                })?;
                if self.inner.logs.get(topic, user_id).is_none() {
                    return Err(PipelineError::NotFound(format!("user message {user_id}")));
                }
                let assistant = if is_mention_variant {
                    Message::assistant_placeholder(topic, user_id, &participant.model)
                } else {
                    let mut reset = message;
                    reset.reset_for_resend(&participant.model);
                    reset
                };
                (user_id, assistant)
            }
        };

        let assistant_id = assistant.id;
        self.inner.logs.upsert(topic, assistant);

        persist(&self.inner, topic).await;

        let unit = self.enqueue_completion(topic, assistant_id, participant);
        Ok(SendReceipt {
            user_id,
            assistant_id,
            unit,
        })
    }

    /// Cancel the topic's in-flight work
    ///
    /// Triggers every cancel callback registered under the topic. The reply
    /// being streamed is finalized as `Paused` with its partial content
    /// committed. Returns the number of callbacks invoked; zero means
    /// nothing was in flight.
    pub fn cancel(&self, topic: TopicId) -> usize {
        self.inner.aborts.trigger(&abort_key(topic))
    }

    /// Wipe a topic
    ///
    /// Discards queued work, clears the log in memory (advancing the topic's
    /// epoch so an executing completion's eventual commit is rejected),
    /// deletes the stored collection, and waits for the executing unit to
    /// wind down. The stream slot is left alone; the epoch check neutralizes
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the durable delete fails; the
    /// in-memory clear is not reverted.
    pub async fn clear_topic(&self, topic: TopicId) -> Result<(), PipelineError> {
        self.inner.queues.clear(topic);
        self.inner.logs.clear(topic);
        self.inner.store.delete(topic).await?;
        self.inner.queues.drain(topic).await;
        Ok(())
    }

    fn enqueue_completion(
        &self,
        topic: TopicId,
        assistant_id: MessageId,
        participant: ParticipantConfig,
    ) -> UnitHandle {
        let inner = self.inner.clone();
        self.inner.queues.enqueue(topic, async move {
            run_completion(inner, topic, assistant_id, participant).await
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.inner.config)
            .finish()
    }
}

fn abort_key(topic: TopicId) -> String {
    format!("topic:{}", topic.0)
}

enum StreamOutcome {
    Terminal,
    Cancelled,
    Failed(String),
}

async fn run_completion(
    inner: Arc<Inner>,
    topic: TopicId,
    assistant_id: MessageId,
    participant: ParticipantConfig,
) -> Result<(), PipelineError> {
    // The slot opens here, not at enqueue time, so a unit still streaming
    // for an earlier request on this topic keeps its slot until it finishes.
    let Some(assistant) = inner.logs.get(topic, assistant_id) else {
        return Err(PipelineError::Cleared);
    };
    inner.streaming.open(topic, assistant);

    let cancel = CancelSignal::new();
    let key = abort_key(topic);
    let registration = {
        let cancel = cancel.clone();
        inner.aborts.register(key.clone(), move || cancel.cancel())
    };

    let request = CompletionRequest {
        topic,
        assistant_id,
        history: inner.logs.history_before(topic, assistant_id),
        participant,
        cancel: cancel.clone(),
    };

    let outcome = match inner.source.stream(request).await {
        Ok(mut rx) => {
            let mut terminal = false;
            while let Some(partial) = rx.recv().await {
                terminal = partial.is_terminal();
                inner.streaming.update(topic, assistant_id, partial);
                if terminal {
                    break;
                }
            }
            if terminal {
                StreamOutcome::Terminal
            } else if cancel.is_cancelled() {
                StreamOutcome::Cancelled
            } else {
                StreamOutcome::Failed("completion ended without a terminal update".to_string())
            }
        }
        Err(e) => StreamOutcome::Failed(e.to_string()),
    };

    inner.aborts.unregister(&key, registration);

    match outcome {
        StreamOutcome::Terminal => finalize_commit(&inner, topic, assistant_id).await,
        StreamOutcome::Cancelled => {
            tracing::debug!(topic = %topic, message = %assistant_id, "Pausing cancelled completion");
            inner.streaming.update(
                topic,
                assistant_id,
                CompletionPartial {
                    status: Some(MessageStatus::Paused),
                    ..CompletionPartial::default()
                },
            );
            finalize_commit(&inner, topic, assistant_id).await
        }
        StreamOutcome::Failed(detail) => {
            tracing::warn!(topic = %topic, message = %assistant_id, detail = %detail, "Completion failed");
            inner.logs.update(topic, assistant_id, |m| {
                m.status = MessageStatus::Error;
                m.error = Some(detail.clone());
            });
            inner.streaming.clear(topic);
            persist(&inner, topic).await;
            inner.bus.emit(PipelineEvent::Error {
                topic,
                detail: detail.clone(),
            });
            Err(PipelineError::CompletionFailure(detail))
        }
    }
}

async fn finalize_commit(
    inner: &Arc<Inner>,
    topic: TopicId,
    assistant_id: MessageId,
) -> Result<(), PipelineError> {
    let Some(message) = inner.streaming.commit(topic, assistant_id) else {
        // Slot gone, superseded, or its generation was cleared.
        return Err(PipelineError::Cleared);
    };

    persist(inner, topic).await;
    inner.bus.emit(PipelineEvent::MessageCommitted {
        message: message.clone(),
    });

    match message.status {
        MessageStatus::Error => {
            let detail = message
                .error
                .unwrap_or_else(|| "completion failed".to_string());
            inner.bus.emit(PipelineEvent::Error {
                topic,
                detail: detail.clone(),
            });
            Err(PipelineError::CompletionFailure(detail))
        }
        MessageStatus::Success => {
            maybe_suggest_rename(inner, topic);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn persist(inner: &Arc<Inner>, topic: TopicId) {
    let snapshot = inner.logs.snapshot(topic);
    if let Err(e) = inner.store.put(topic, snapshot).await {
        tracing::warn!(topic = %topic, error = %e, "Failed to persist topic log");
        inner.bus.emit(PipelineEvent::Error {
            topic,
            detail: format!("persistence failed: {e}"),
        });
    }
}

fn maybe_suggest_rename(inner: &Arc<Inner>, topic: TopicId) {
    if !inner.config.rename_suggestions {
        return;
    }
    let snapshot = inner.logs.snapshot(topic);
    // Only after the very first completed exchange of the topic.
    if snapshot.len() != 2 {
        return;
    }
    let Some(first_user) = snapshot.iter().find(|m| m.role == MessageRole::User) else {
        return;
    };
    let name = suggest_name(&first_user.content);
    if name.is_empty() {
        return;
    }
    inner.bus.emit(PipelineEvent::RenameSuggested { topic, name });
}

fn suggest_name(content: &str) -> String {
    let first_line = content.trim().lines().next().unwrap_or("").trim();
    first_line.chars().take(MAX_SUGGESTED_NAME_CHARS).collect()
}
