//! Abort Registry
//!
//! Process-wide map from cancellation key to an ordered list of cancel
//! callbacks. Keys are free-form strings so embedders can scope cancellation
//! however they like (per topic, per request, per batch).
//!
//! Triggering a key invokes its callbacks in registration order and removes
//! each as it is invoked, so a second trigger of the same key is a no-op
//! unless new callbacks were registered in between.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Callback invoked when its key is triggered
pub type AbortCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle identifying one registered callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortRegistration(u64);

struct AbortEntry {
    registration: AbortRegistration,
    callback: AbortCallback,
}

/// Registry of cancel callbacks keyed by string
#[derive(Default)]
pub struct AbortRegistry {
    entries: DashMap<String, Arc<Mutex<Vec<AbortEntry>>>>,
    next_id: AtomicU64,
}

impl AbortRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a key
    ///
    /// Returns a registration handle usable with [`Self::unregister`].
    pub fn register<F>(&self, key: impl Into<String>, callback: F) -> AbortRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let registration = AbortRegistration(self.next_id.fetch_add(1, Ordering::Relaxed));
        let list = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        list.lock().push(AbortEntry {
            registration,
            callback: Box::new(callback),
        });
        registration
    }

    /// Remove one callback without invoking it
    pub fn unregister(&self, key: &str, registration: AbortRegistration) {
        if let Some(list) = self.entries.get(key).map(|e| e.clone()) {
            list.lock().retain(|entry| entry.registration != registration);
        }
    }

    /// Discard every callback under a key without invoking any
    pub fn unregister_all(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Invoke and remove every callback under a key, in registration order
    ///
    /// A panicking callback is logged and does not prevent the rest from
    /// running. Unknown keys are a no-op. Returns the number of callbacks
    /// invoked.
    pub fn trigger(&self, key: &str) -> usize {
        let Some((_, list)) = self.entries.remove(key) else {
            return 0;
        };
        let drained: Vec<AbortEntry> = std::mem::take(&mut *list.lock());
        let count = drained.len();
        for entry in drained {
            let result = catch_unwind(AssertUnwindSafe(entry.callback));
            if result.is_err() {
                tracing::warn!(key = %key, "Abort callback panicked");
            }
        }
        count
    }

    /// Number of callbacks currently registered under a key
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |list| list.lock().len())
    }

    /// Whether a key has no registered callbacks
    #[must_use]
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

impl std::fmt::Debug for AbortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortRegistry")
            .field("keys", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_trigger_runs_in_registration_order() {
        let registry = AbortRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            registry.register("job", move || order.lock().push(i));
        }

        let invoked = registry.trigger("job");
        assert_eq!(invoked, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_trigger_removes_callbacks() {
        let registry = AbortRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        registry.register("job", move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.trigger("job"), 1);
        assert_eq!(registry.trigger("job"), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty("job"));
    }

    #[test]
    fn test_trigger_unknown_key_is_noop() {
        let registry = AbortRegistry::new();
        assert_eq!(registry.trigger("nothing"), 0);
    }

    #[test]
    fn test_unregister_removes_only_target() {
        let registry = AbortRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let keep = registry.register("job", move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let drop_reg = registry.register("job", move || {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        let _ = keep;

        registry.unregister("job", drop_reg);
        assert_eq!(registry.len("job"), 1);

        registry.trigger("job");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_rest() {
        let registry = AbortRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        registry.register("job", || panic!("boom"));
        let count_clone = count.clone();
        registry.register("job", move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.trigger("job"), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_all_discards_without_invoking() {
        let registry = AbortRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        registry.register("job", move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.unregister_all("job");
        assert_eq!(registry.trigger("job"), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
