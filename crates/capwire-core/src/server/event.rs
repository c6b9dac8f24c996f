//! Observable event sources exposed by handlers.
//!
//! A handler owns one [`EventSource`] per event it publishes and fires it with
//! [`EventSource::emit`]. Observers are attached through [`EventSource::attach`],
//! which returns a cancellable [`EventSubscription`] handle; detaching is an
//! explicit handle operation (or dropping the handle).

use crate::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

/// Callback invoked with the serialized event data on every firing.
pub type Observer = Arc<dyn Fn(&Value) + Send + Sync>;

struct SourceInner {
    name: String,
    observers: Mutex<HashMap<u64, Observer>>,
    next_id: AtomicU64,
}

/// A named event that observers can attach to.
///
/// Cloning yields another handle to the same source.
#[derive(Clone)]
pub struct EventSource {
    inner: Arc<SourceInner>,
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.inner.name)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl EventSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                name: name.into(),
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Externally visible event name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach an observer; it stays attached until the returned handle is
    /// cancelled or dropped.
    pub fn attach<F>(&self, observer: F) -> EventSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(observer));

        debug!("Observer {} attached to event '{}'", id, self.inner.name);

        EventSubscription {
            id,
            source: Arc::downgrade(&self.inner),
        }
    }

    /// Fire the event, returning how many observers were notified.
    ///
    /// The data is serialized once; observers run synchronously on the
    /// caller's thread, outside the observer lock.
    pub fn emit<T: Serialize + ?Sized>(&self, data: &T) -> Result<usize> {
        let value = serde_json::to_value(data)?;

        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for observer in &observers {
            observer(&value);
        }

        Ok(observers.len())
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle to one attached observer. Dropping detaches it.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    source: Weak<SourceInner>,
}

impl EventSubscription {
    /// Detach the observer now.
    pub fn cancel(self) {
        // Drop does the work.
    }

    fn detach(&self) {
        if let Some(source) = self.source.upgrade() {
            let removed = source
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            if removed.is_some() {
                debug!("Observer {} detached from event '{}'", self.id, source.name);
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_observer(counter: &Arc<AtomicUsize>) -> impl Fn(&Value) + Send + Sync + 'static {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_emit_without_observers() {
        let source = EventSource::new("viewChanged");
        assert_eq!(source.emit(&"nothing").unwrap(), 0);
    }

    #[test]
    fn test_emit_reaches_every_observer() {
        let source = EventSource::new("viewChanged");
        let counter = Arc::new(AtomicUsize::new(0));
        let _a = source.attach(counting_observer(&counter));
        let _b = source.attach(counting_observer(&counter));

        assert_eq!(source.emit(&serde_json::json!({"view": 3})).unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_receives_serialized_data() {
        let source = EventSource::new("battleResultChanged");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = source.attach(move |value| sink.lock().unwrap().push(value.clone()));

        source.emit(&(1, "two")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!([1, "two"])]);
    }

    #[test]
    fn test_cancel_detaches_only_that_observer() {
        let source = EventSource::new("viewChanged");
        let counter = Arc::new(AtomicUsize::new(0));
        let first = source.attach(counting_observer(&counter));
        let _second = source.attach(counting_observer(&counter));

        first.cancel();
        assert_eq!(source.observer_count(), 1);

        source.emit(&()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_detaches() {
        let source = EventSource::new("viewChanged");
        {
            let _sub = source.attach(|_| {});
            assert_eq!(source.observer_count(), 1);
        }
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn test_handle_outliving_source_is_harmless() {
        let source = EventSource::new("gone");
        let sub = source.attach(|_| {});
        drop(source);
        sub.cancel();
    }
}
