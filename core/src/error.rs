//! Pipeline Error Types
//!
//! The typed error surface of the crate. Completion transports report their
//! failures through `anyhow` at the trait boundary; everything the pipeline
//! itself can fail with is enumerated here.

use thiserror::Error;

use crate::store::StoreError;

/// Errors produced by pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The completion source failed or ended without a terminal partial
    #[error("completion failed: {0}")]
    CompletionFailure(String),

    /// A referenced message or linkage is missing from the topic log
    #[error("message not found: {0}")]
    NotFound(String),

    /// The durable store rejected an operation
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The queued unit was discarded by a topic clear before it ran
    #[error("unit cleared before execution")]
    Cleared,

    /// The topic's queue worker is gone
    #[error("topic queue closed")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: PipelineError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(err.to_string(), "storage backend failure: disk full");
    }

    #[test]
    fn test_display_messages() {
        let err = PipelineError::CompletionFailure("timeout".to_string());
        assert_eq!(err.to_string(), "completion failed: timeout");
        assert_eq!(PipelineError::Cleared.to_string(), "unit cleared before execution");
    }
}
