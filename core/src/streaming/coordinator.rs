//! Streaming Coordinator
//!
//! Owns the per-topic stream slots and the trailing-edge flush timing.
//!
//! # Design Philosophy
//!
//! Partials arrive much faster than anyone wants to observe them. Every
//! update merges into the slot immediately, but a `StreamUpdate` event is
//! emitted at most once per flush interval, always carrying the latest
//! merged state, and the last pending state is always flushed once the
//! interval elapses. Commit is the only path from slot to log, and it
//! verifies two things recorded when the slot was opened: the topic epoch
//! (a reply started before `clear` can never resurrect a cleared topic)
//! and the reply's message id (a reply superseded by a newer request can
//! never write under the new request's identity).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::completion::CompletionPartial;
use crate::events::{EventBus, PipelineEvent};
use crate::messages::{Message, MessageId, MessageRole, MessageStatus, TopicId};
use crate::topic::TopicLogs;

#[derive(Debug)]
struct SlotState {
    message: Message,
    epoch: u64,
    flush_scheduled: bool,
}

/// Per-topic stream slots with throttled flushes and exactly-once commit
pub struct StreamingCoordinator {
    slots: DashMap<TopicId, Arc<Mutex<SlotState>>>,
    logs: Arc<TopicLogs>,
    bus: EventBus,
    flush_interval: Duration,
}

impl StreamingCoordinator {
    /// Create a coordinator over the given logs and event bus
    #[must_use]
    pub fn new(logs: Arc<TopicLogs>, bus: EventBus, flush_interval: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            logs,
            bus,
            flush_interval,
        }
    }

    /// Open (or replace) the topic's stream slot
    ///
    /// The last request wins: an existing slot is overwritten and its pending
    /// flush cancelled. A replaced reply that was still in progress is
    /// finalized as `Paused` in the log so it never lingers in `Sending`.
    /// The slot records the topic's current epoch; a later `clear` on the
    /// topic advances the epoch and invalidates the commit.
    pub fn open(&self, topic: TopicId, initial: Message) {
        let epoch = self.logs.epoch(topic);
        let new_id = initial.id;
        let state = Arc::new(Mutex::new(SlotState {
            message: initial,
            epoch,
            flush_scheduled: false,
        }));
        if let Some(previous) = self.slots.insert(topic, state) {
            let mut guard = previous.lock();
            guard.flush_scheduled = false;
            if guard.message.id != new_id
                && guard.message.is_in_progress()
                && guard.epoch == epoch
            {
                guard.message.status = MessageStatus::Paused;
                self.logs.upsert(topic, guard.message.clone());
                tracing::debug!(
                    topic = %topic,
                    message = %guard.message.id,
                    "Superseded in-progress reply, finalized as paused"
                );
            } else {
                tracing::debug!(topic = %topic, "Replaced existing stream slot");
            }
        }
    }

    /// Merge a partial into the topic's slot
    ///
    /// `assistant_id` names the reply the partial belongs to; updates whose
    /// slot holds a different reply are dropped, as are updates against an
    /// absent slot. Fields present in the partial override the slot's
    /// values; absent fields keep theirs. A flush is scheduled for one
    /// interval from now unless one is already pending.
    pub fn update(&self, topic: TopicId, assistant_id: MessageId, partial: CompletionPartial) {
        let Some(state) = self.slots.get(&topic).map(|s| s.clone()) else {
            tracing::debug!(topic = %topic, "Dropped update for absent stream slot");
            return;
        };

        let mut guard = state.lock();
        if guard.message.id != assistant_id {
            tracing::debug!(
                topic = %topic,
                message = %assistant_id,
                "Dropped update for superseded reply"
            );
            return;
        }
        if let Some(content) = partial.content {
            guard.message.content = content;
        }
        if let Some(status) = partial.status {
            guard.message.status = status;
        }
        if let Some(usage) = partial.usage {
            guard.message.usage = Some(usage);
        }
        if let Some(error) = partial.error {
            guard.message.error = Some(error);
        }
        let schedule = if guard.flush_scheduled {
            false
        } else {
            guard.flush_scheduled = true;
            true
        };
        drop(guard);

        if schedule {
            let bus = self.bus.clone();
            let interval = self.flush_interval;
            tokio::spawn(async move {
                sleep(interval).await;
                let message = {
                    let mut guard = state.lock();
                    if !guard.flush_scheduled {
                        // Slot was committed, cleared, or replaced meanwhile.
                        return;
                    }
                    guard.flush_scheduled = false;
                    guard.message.clone()
                };
                bus.emit(PipelineEvent::StreamUpdate { message });
            });
        }
    }

    /// Current merged state of the topic's slot
    #[must_use]
    pub fn current(&self, topic: TopicId) -> Option<Message> {
        self.slots.get(&topic).map(|s| s.lock().message.clone())
    }

    /// Commit the topic's slot into the log
    ///
    /// Writes the slot's message into the topic log (replacing an entry with
    /// the same id in place, appending otherwise), clears the slot, and
    /// returns the committed message. No-op returning `None` when the slot
    /// is absent, holds a different reply than `assistant_id`, is
    /// non-assistant, or is still in progress. A slot whose epoch predates
    /// the topic's last clear is discarded without committing. Only the
    /// exact slot that was examined is removed, so a concurrently opened
    /// replacement is never deleted.
    pub fn commit(&self, topic: TopicId, assistant_id: MessageId) -> Option<Message> {
        let state = self.slots.get(&topic).map(|s| s.clone())?;

        let message = {
            let mut guard = state.lock();
            if guard.message.id != assistant_id {
                tracing::debug!(
                    topic = %topic,
                    message = %assistant_id,
                    "Refusing to commit superseded reply"
                );
                return None;
            }
            if guard.message.role != MessageRole::Assistant {
                tracing::debug!(topic = %topic, "Refusing to commit non-assistant slot");
                return None;
            }
            if guard.message.is_in_progress() {
                tracing::debug!(topic = %topic, "Refusing to commit in-progress slot");
                return None;
            }
            if guard.epoch != self.logs.epoch(topic) {
                guard.flush_scheduled = false;
                drop(guard);
                self.slots
                    .remove_if(&topic, |_, stored| Arc::ptr_eq(stored, &state));
                tracing::warn!(topic = %topic, "Rejected commit from a cleared generation");
                return None;
            }
            guard.flush_scheduled = false;
            guard.message.clone()
        };
        self.slots
            .remove_if(&topic, |_, stored| Arc::ptr_eq(stored, &state));

        self.logs.upsert(topic, message.clone());
        tracing::debug!(topic = %topic, message = %message.id, status = %message.status, "Committed stream slot");
        Some(message)
    }

    /// Unconditionally empty the topic's slot
    pub fn clear(&self, topic: TopicId) {
        if let Some((_, state)) = self.slots.remove(&topic) {
            state.lock().flush_scheduled = false;
        }
    }
}

impl std::fmt::Debug for StreamingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCoordinator")
            .field("open_slots", &self.slots.len())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn coordinator(interval_ms: u64) -> (StreamingCoordinator, Arc<TopicLogs>, EventBus) {
        let logs = Arc::new(TopicLogs::new());
        let bus = EventBus::new(64);
        let coordinator = StreamingCoordinator::new(
            logs.clone(),
            bus.clone(),
            Duration::from_millis(interval_ms),
        );
        (coordinator, logs, bus)
    }

    fn placeholder(logs: &TopicLogs, topic: TopicId) -> Message {
        let user = Message::user(topic, "question");
        logs.upsert(topic, user.clone());
        Message::assistant_placeholder(topic, user.id, "test-model")
    }

    fn drain_stream_updates(rx: &mut tokio::sync::broadcast::Receiver<PipelineEvent>) -> Vec<Message> {
        let mut flushes = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(PipelineEvent::StreamUpdate { message }) => flushes.push(message),
                Ok(_) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        flushes
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_are_coalesced_trailing_edge() {
        let (coordinator, logs, bus) = coordinator(100);
        let topic = TopicId::new();
        let mut rx = bus.subscribe();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);

        // Four rapid updates, then one after the first flush fired.
        coordinator.update(topic, id, CompletionPartial::delta("H"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.update(topic, id, CompletionPartial::delta("Hi"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.update(topic, id, CompletionPartial::delta("Hi t"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.update(topic, id, CompletionPartial::delta("Hi th"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        coordinator.update(topic, id, CompletionPartial::delta("Hi there"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let flushes = drain_stream_updates(&mut rx);
        let contents: Vec<_> = flushes.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi th", "Hi there"]);
    }

    #[tokio::test]
    async fn test_update_without_slot_is_dropped() {
        let (coordinator, _logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        coordinator.update(topic, MessageId::new(), CompletionPartial::delta("ignored"));
        assert!(coordinator.current(topic).is_none());
    }

    #[tokio::test]
    async fn test_update_for_other_reply_is_dropped() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        coordinator.open(topic, reply);
        coordinator.update(topic, MessageId::new(), CompletionPartial::delta("stray"));

        let current = coordinator.current(topic).unwrap();
        assert!(current.content.is_empty());
        assert_eq!(current.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn test_merge_keeps_absent_fields() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::delta("partial answer"));
        coordinator.update(
            topic,
            id,
            CompletionPartial {
                usage: Some(serde_json::json!({"tokens": 7})),
                ..CompletionPartial::default()
            },
        );

        let current = coordinator.current(topic).unwrap();
        assert_eq!(current.content, "partial answer");
        assert_eq!(current.status, MessageStatus::Pending);
        assert!(current.usage.is_some());
    }

    #[tokio::test]
    async fn test_commit_is_exactly_once() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::done("final answer"));

        let committed = coordinator.commit(topic, id).unwrap();
        assert_eq!(committed.content, "final answer");
        assert_eq!(committed.status, MessageStatus::Success);
        assert_eq!(logs.len(topic), 2);

        // Slot is gone; a second commit is a no-op.
        assert!(coordinator.commit(topic, id).is_none());
        assert_eq!(logs.len(topic), 2);
    }

    #[tokio::test]
    async fn test_commit_for_other_reply_is_refused() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::done("mine"));

        // A stale requester cannot commit, and the slot survives for its owner.
        assert!(coordinator.commit(topic, MessageId::new()).is_none());
        assert_eq!(logs.len(topic), 1);
        assert!(coordinator.current(topic).is_some());

        coordinator.commit(topic, id).unwrap();
        assert_eq!(logs.len(topic), 2);
    }

    #[tokio::test]
    async fn test_commit_refuses_in_progress_slot() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::delta("still going"));

        assert!(coordinator.commit(topic, id).is_none());
        // Slot survives the refused commit.
        assert!(coordinator.current(topic).is_some());
        assert_eq!(logs.len(topic), 1);
    }

    #[tokio::test]
    async fn test_commit_replaces_existing_entry_in_place() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        logs.upsert(topic, reply.clone());
        assert_eq!(logs.len(topic), 2);

        coordinator.open(topic, reply.clone());
        coordinator.update(topic, reply.id, CompletionPartial::done("replaced"));
        coordinator.commit(topic, reply.id).unwrap();

        assert_eq!(logs.len(topic), 2);
        assert_eq!(logs.get(topic, reply.id).unwrap().content, "replaced");
    }

    #[tokio::test]
    async fn test_commit_rejected_after_topic_clear() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::done("from before the clear"));

        logs.clear(topic);
        assert!(coordinator.commit(topic, id).is_none());
        assert!(logs.is_empty(topic));
        assert!(coordinator.current(topic).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_flush() {
        let (coordinator, logs, bus) = coordinator(100);
        let topic = TopicId::new();
        let mut rx = bus.subscribe();

        let reply = placeholder(&logs, topic);
        let id = reply.id;
        coordinator.open(topic, reply);
        coordinator.update(topic, id, CompletionPartial::delta("doomed"));
        coordinator.clear(topic);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(drain_stream_updates(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_open_replaces_slot_last_request_wins() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let first = placeholder(&logs, topic);
        let first_id = first.id;
        logs.upsert(topic, first.clone());
        coordinator.open(topic, first);
        coordinator.update(topic, first_id, CompletionPartial::delta("first request"));

        let second = placeholder(&logs, topic);
        let second_id = second.id;
        coordinator.open(topic, second);

        let current = coordinator.current(topic).unwrap();
        assert_eq!(current.id, second_id);
        assert!(current.content.is_empty());
    }

    #[tokio::test]
    async fn test_open_finalizes_superseded_reply_as_paused() {
        let (coordinator, logs, _bus) = coordinator(100);
        let topic = TopicId::new();

        let first = placeholder(&logs, topic);
        let first_id = first.id;
        logs.upsert(topic, first.clone());
        coordinator.open(topic, first);
        coordinator.update(topic, first_id, CompletionPartial::delta("cut short"));

        let second = placeholder(&logs, topic);
        let second_id = second.id;
        coordinator.open(topic, second);

        // The replaced reply is terminal in the log with its partial content,
        // and its late partials and commit go nowhere.
        let superseded = logs.get(topic, first_id).unwrap();
        assert_eq!(superseded.status, MessageStatus::Paused);
        assert_eq!(superseded.content, "cut short");

        coordinator.update(topic, first_id, CompletionPartial::done("too late"));
        assert!(coordinator.commit(topic, first_id).is_none());
        let current = coordinator.current(topic).unwrap();
        assert_eq!(current.id, second_id);
        assert!(current.content.is_empty());
    }
}
