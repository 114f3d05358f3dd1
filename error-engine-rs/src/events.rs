//! Subscriber lists for engine events
//!
//! Callbacks run synchronously on the pipeline task. A panicking subscriber
//! is logged and skipped; it never stops delivery to the others or the
//! pipeline itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::aggregation::AggregationEvent;
use crate::correlation::CorrelationEvent;
use crate::types::ErrorDetails;

pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observers<T> {
    event: &'static str,
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> Observers<T> {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the id was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, payload: &T) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let callbacks: Vec<(SubscriptionId, Callback<T>)> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!(event = self.event, subscription = id, "Event subscriber panicked");
            }
        }
    }
}

/// All event streams the engine publishes
pub struct EventHub {
    pub errors: Observers<ErrorDetails>,
    pub aggregations: Observers<AggregationEvent>,
    pub correlations: Observers<CorrelationEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            errors: Observers::new("error"),
            aggregations: Observers::new("errorAggregated"),
            correlations: Observers::new("errorsCorrelated"),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let observers: Observers<u32> = Observers::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let id = observers.subscribe(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });

        observers.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let observers: Observers<&'static str> = Observers::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        observers.subscribe(|_| panic!("subscriber bug"));
        let counter = seen.clone();
        observers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&"boom");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let hub = EventHub::new();
        let a = hub.errors.subscribe(|_| {});
        let b = hub.errors.subscribe(|_| {});
        assert_ne!(a, b);
        assert_eq!(hub.errors.len(), 2);
    }
}
