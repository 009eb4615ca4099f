//! Topic Queue Manager
//!
//! Per-topic FIFO execution of async units of work. Each topic gets a lazily
//! created worker task with an unbounded mailbox; the worker runs one unit to
//! completion before taking the next, so work within a topic is strictly
//! serialized while topics proceed independently.
//!
//! # Architecture
//!
//! ```text
//! enqueue(topic, unit) ──> mailbox ──> worker task ──> unit.await
//!                             │                            │
//!                      clear(topic) bumps epoch     result ──> UnitHandle
//! ```
//!
//! `clear` never interrupts the executing unit. It advances the topic's epoch;
//! the worker skips mailbox entries stamped with an older epoch and resolves
//! their handles with [`PipelineError::Cleared`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::PipelineError;
use crate::messages::TopicId;

struct QueuedUnit {
    epoch: u64,
    fut: BoxFuture<'static, Result<(), PipelineError>>,
    done: oneshot::Sender<Result<(), PipelineError>>,
}

#[derive(Clone)]
struct QueueHandle {
    tx: mpsc::UnboundedSender<QueuedUnit>,
    pending: Arc<AtomicUsize>,
    epoch: Arc<AtomicU64>,
    idle: Arc<Notify>,
}

/// Handle to a queued unit; resolves with the unit's result
pub struct UnitHandle {
    rx: oneshot::Receiver<Result<(), PipelineError>>,
}

impl UnitHandle {
    /// Wait for the unit to finish (or be cleared)
    ///
    /// # Errors
    ///
    /// Returns the unit's own error, [`PipelineError::Cleared`] if the unit
    /// was discarded before running, or [`PipelineError::QueueClosed`] if the
    /// worker went away.
    pub async fn join(self) -> Result<(), PipelineError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::QueueClosed),
        }
    }
}

/// Per-topic FIFO queues with one worker task each
#[derive(Default)]
pub struct TopicQueues {
    handles: DashMap<TopicId, QueueHandle>,
}

impl TopicQueues {
    /// Create an empty queue manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, topic: TopicId) -> QueueHandle {
        self.handles
            .entry(topic)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = QueueHandle {
                    tx,
                    pending: Arc::new(AtomicUsize::new(0)),
                    epoch: Arc::new(AtomicU64::new(0)),
                    idle: Arc::new(Notify::new()),
                };
                tokio::spawn(run_worker(topic, rx, handle.clone()));
                handle
            })
            .clone()
    }

    /// Enqueue a unit for a topic
    ///
    /// Units run strictly in enqueue order within the topic. The returned
    /// handle resolves with the unit's result; a failing unit does not halt
    /// the queue.
    pub fn enqueue<F>(&self, topic: TopicId, fut: F) -> UnitHandle
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let handle = self.handle(topic);
        let (done, rx) = oneshot::channel();
        let unit = QueuedUnit {
            epoch: handle.epoch.load(Ordering::SeqCst),
            fut: Box::pin(fut),
            done,
        };
        handle.pending.fetch_add(1, Ordering::SeqCst);
        if handle.tx.send(unit).is_err() {
            // Worker is gone; undo the count so drain stays accurate.
            handle.pending.fetch_sub(1, Ordering::SeqCst);
        }
        UnitHandle { rx }
    }

    /// Number of units enqueued but not yet finished for a topic
    #[must_use]
    pub fn pending(&self, topic: TopicId) -> usize {
        self.handles
            .get(&topic)
            .map_or(0, |h| h.pending.load(Ordering::SeqCst))
    }

    /// Wait until the topic's queue is empty
    ///
    /// Resolves immediately for unknown topics. Does not block new enqueues;
    /// units enqueued while draining extend the wait.
    pub async fn drain(&self, topic: TopicId) {
        let Some(handle) = self.handles.get(&topic).map(|h| h.clone()) else {
            return;
        };
        loop {
            let notified = handle.idle.notified();
            if handle.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Discard not-yet-started units for a topic
    ///
    /// The executing unit (if any) is left to finish. Discarded units resolve
    /// their handles with [`PipelineError::Cleared`].
    pub fn clear(&self, topic: TopicId) {
        if let Some(handle) = self.handles.get(&topic) {
            let epoch = handle.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(topic = %topic, epoch, "Cleared topic queue");
        }
    }
}

impl std::fmt::Debug for TopicQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicQueues")
            .field("topics", &self.handles.len())
            .finish()
    }
}

async fn run_worker(
    topic: TopicId,
    mut rx: mpsc::UnboundedReceiver<QueuedUnit>,
    handle: QueueHandle,
) {
    while let Some(unit) = rx.recv().await {
        let current = handle.epoch.load(Ordering::SeqCst);
        let result = if unit.epoch < current {
            tracing::debug!(topic = %topic, "Skipping cleared unit");
            Err(PipelineError::Cleared)
        } else {
            unit.fut.await
        };
        // Receiver may have been dropped; the unit still counts as done.
        let _ = unit.done.send(result);
        if handle.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            handle.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_units_run_in_enqueue_order() {
        let queues = TopicQueues::new();
        let topic = TopicId::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            handles.push(queues.enqueue(topic, async move {
                order.lock().push(i);
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failing_unit_does_not_halt_queue() {
        let queues = TopicQueues::new();
        let topic = TopicId::new();

        let failing = queues.enqueue(topic, async {
            Err(PipelineError::CompletionFailure("nope".to_string()))
        });
        let following = queues.enqueue(topic, async { Ok(()) });

        assert!(matches!(
            failing.join().await,
            Err(PipelineError::CompletionFailure(_))
        ));
        following.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_topics_run_concurrently() {
        let queues = TopicQueues::new();
        let slow_topic = TopicId::new();
        let fast_topic = TopicId::new();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = queues.enqueue(slow_topic, async move {
            let _ = release_rx.await;
            Ok(())
        });
        let fast = queues.enqueue(fast_topic, async { Ok(()) });

        // The fast topic finishes while the slow topic's unit is blocked.
        fast.join().await.unwrap();
        release_tx.send(()).unwrap();
        slow.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_all_units() {
        let queues = Arc::new(TopicQueues::new());
        let topic = TopicId::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            queues.enqueue(topic, async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queues.drain(topic).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(queues.pending(topic), 0);
    }

    #[tokio::test]
    async fn test_drain_unknown_topic_resolves_immediately() {
        let queues = TopicQueues::new();
        queues.drain(TopicId::new()).await;
    }

    #[tokio::test]
    async fn test_clear_discards_waiting_units_only() {
        let queues = TopicQueues::new();
        let topic = TopicId::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let executing = {
            let ran = ran.clone();
            queues.enqueue(topic, async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let waiting = {
            let ran = ran.clone();
            queues.enqueue(topic, async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        started_rx.await.unwrap();
        queues.clear(topic);
        release_tx.send(()).unwrap();

        // The executing unit finishes; the waiting one was discarded.
        executing.join().await.unwrap();
        assert!(matches!(waiting.join().await, Err(PipelineError::Cleared)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_clear_runs_normally() {
        let queues = TopicQueues::new();
        let topic = TopicId::new();

        queues.enqueue(topic, async { Ok(()) }).join().await.unwrap();
        queues.clear(topic);

        let after = queues.enqueue(topic, async { Ok(()) });
        after.join().await.unwrap();
    }
}
