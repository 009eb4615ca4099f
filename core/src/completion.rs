//! Completion Source Interface
//!
//! The boundary between the pipeline and whatever produces assistant
//! replies. Implementations stream progressively fuller partials over a
//! channel; transport, provider selection, and authentication are entirely
//! the implementor's concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::messages::{Message, MessageId, MessageStatus, TopicId};

/// Cooperative cancellation flag shared with an in-flight completion
///
/// The pipeline sets the flag when the request is cancelled; sources should
/// check it between chunks and stop producing once set. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create a fresh, uncancelled signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Which model answers, and how
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Model identifier handed to the completion source
    pub model: String,
    /// Optional system prompt
    pub prompt: Option<String>,
    /// Provider-specific settings, passed through unchanged
    pub settings: Option<Value>,
}

impl ParticipantConfig {
    /// Create a participant for the given model
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: None,
            settings: None,
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Attach provider-specific settings
    #[must_use]
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// One streamed update of the reply being produced
///
/// Fields left `None` keep their previous value when merged into the stream
/// slot; `content` is cumulative, not a delta.
#[derive(Clone, Debug, Default)]
pub struct CompletionPartial {
    /// Full content so far
    pub content: Option<String>,
    /// New lifecycle status, when it changes
    pub status: Option<MessageStatus>,
    /// Token usage, usually only on the final partial
    pub usage: Option<Value>,
    /// Failure detail accompanying an `Error` status
    pub error: Option<String>,
}

impl CompletionPartial {
    /// In-progress partial carrying the content so far
    #[must_use]
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(MessageStatus::Pending),
            ..Self::default()
        }
    }

    /// Final successful partial with the complete content
    #[must_use]
    pub fn done(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(MessageStatus::Success),
            ..Self::default()
        }
    }

    /// Final failing partial
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MessageStatus::Error),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach token usage
    #[must_use]
    pub fn with_usage(mut self, usage: Value) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether this partial ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }
}

/// A completion request handed to the source
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    /// Topic being answered
    pub topic: TopicId,
    /// Id of the assistant message being filled
    pub assistant_id: MessageId,
    /// Committed history, oldest first, in-progress messages excluded
    pub history: Vec<Message>,
    /// Which model answers, and how
    pub participant: ParticipantConfig,
    /// Cooperative cancellation flag; check between chunks
    pub cancel: CancelSignal,
}

/// Something that produces streamed assistant replies
///
/// The returned receiver yields progressively fuller partials and closes
/// after the terminal one. A stream that closes without a terminal partial
/// is treated as failed by the pipeline, or as paused when cancellation was
/// requested.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Start a streaming completion
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<CompletionPartial>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_signal_shared_across_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());

        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_partial_terminality() {
        assert!(!CompletionPartial::delta("Hi").is_terminal());
        assert!(CompletionPartial::done("Hi there").is_terminal());
        assert!(CompletionPartial::failed("timeout").is_terminal());
    }

    #[test]
    fn test_participant_builder() {
        let participant = ParticipantConfig::new("gpt-test")
            .with_prompt("Be brief.")
            .with_settings(serde_json::json!({"temperature": 0.2}));

        assert_eq!(participant.model, "gpt-test");
        assert_eq!(participant.prompt.as_deref(), Some("Be brief."));
        assert!(participant.settings.is_some());
    }
}
