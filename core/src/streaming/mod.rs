//! Streaming Subsystem
//!
//! One mutable stream slot per topic, filled by completion partials and
//! committed exactly once into the topic log when the reply reaches a
//! terminal status. Observable propagation of in-progress state is
//! trailing-edge throttled so subscribers see coalesced updates instead of
//! every chunk.

mod coordinator;

pub use coordinator::StreamingCoordinator;
