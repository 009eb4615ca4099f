//! # dialog-core
//!
//! Headless per-topic request-queue and streaming-commit engine for
//! conversational message pipelines.
//!
//! # Design Philosophy
//!
//! The crate is an orchestration core, not a chat client: rendering, token
//! accounting, provider transport, and on-disk encoding all live behind
//! narrow interfaces supplied by the embedder. What the core guarantees is
//! the hard part of a streaming conversation UI:
//!
//! - at most one completion in flight per topic, topics independent
//! - partial output coalesced into one mutable slot per topic, propagated
//!   with trailing-edge throttling
//! - exactly-once commit of each reply into the topic's ordered log
//! - cancellation by key, finalizing the interrupted reply as paused
//! - resend that preserves message identity and question/answer linkage
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── Pipeline ──────────────────────────┐
//! │                                                              │
//! │  TopicLogs        TopicQueues        StreamingCoordinator    │
//! │  (ordered log,    (per-topic FIFO    (slot + throttled       │
//! │   epoch per        worker tasks)      flush + commit)        │
//! │   topic)                                                     │
//! │                                                              │
//! │  AbortRegistry    EventBus (broadcast)                       │
//! └──────────┬──────────────────┬────────────────────────────────┘
//!            │                  │
//!      MessageStore      CompletionSource
//!      (durable           (streamed partials
//!       snapshots)         over a channel)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use dialog_core::{
//!     MemoryStore, ParticipantConfig, Pipeline, PipelineConfig, SendOptions, TopicId,
//! };
//! # use dialog_core::{CompletionRequest, CompletionPartial, CompletionSource};
//! # use tokio::sync::mpsc;
//! # struct MySource;
//! # #[async_trait::async_trait]
//! # impl CompletionSource for MySource {
//! #     async fn stream(
//! #         &self,
//! #         _request: CompletionRequest,
//! #     ) -> anyhow::Result<mpsc::Receiver<CompletionPartial>> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # async fn example() {
//! let pipeline = Pipeline::new(
//!     PipelineConfig::from_env(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MySource),
//! );
//!
//! let topic = TopicId::new();
//! let receipt = pipeline
//!     .send(topic, "Hi", ParticipantConfig::new("my-model"), SendOptions::new())
//!     .await;
//! receipt.unit.join().await.unwrap();
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod abort;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod streaming;
pub mod topic;

pub use abort::{AbortRegistration, AbortRegistry};
pub use completion::{
    CancelSignal, CompletionPartial, CompletionRequest, CompletionSource, ParticipantConfig,
};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use events::{EventBus, PipelineEvent};
pub use messages::{Message, MessageId, MessageRole, MessageStatus, TopicId};
pub use pipeline::{Pipeline, SendOptions, SendReceipt};
pub use queue::{TopicQueues, UnitHandle};
pub use store::{MemoryStore, MessageStore, StoreError};
pub use streaming::StreamingCoordinator;
pub use topic::{TopicLog, TopicLogs};
