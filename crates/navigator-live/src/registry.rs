//! Scoped topic registry for fanning live updates out to in-process listeners.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Callback<T>)>>,
}

/// Topic → callbacks map owned by whoever created it.
///
/// Cloning shares the same underlying registry.
pub struct EventRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T> Clone for EventRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EventRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 1,
                topics: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` on `topic`. The callback stays registered until the
    /// returned subscription is unsubscribed or dropped.
    #[must_use = "dropping the subscription unregisters the callback"]
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> RegistrySubscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: Send,
    {
        let topic = topic.into();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .topics
                .entry(topic.clone())
                .or_default()
                .push((id, Arc::new(callback)));
            id
        };

        let registry = Arc::downgrade(&self.inner);
        let detach_topic = topic.clone();
        RegistrySubscription {
            topic,
            detach: Some(Box::new(move || {
                let Some(inner) = registry.upgrade() else {
                    return;
                };
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(callbacks) = inner.topics.get_mut(&detach_topic) {
                    callbacks.retain(|(callback_id, _)| *callback_id != id);
                    if callbacks.is_empty() {
                        inner.topics.remove(&detach_topic);
                    }
                }
            })),
        }
    }

    /// Call every callback registered on `topic`; returns how many ran to completion.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking callback is logged and skipped.
    pub fn emit(&self, topic: &str, payload: &T) -> usize {
        let callbacks: Vec<Callback<T>> = self
            .lock()
            .topics
            .get(topic)
            .map(|callbacks| callbacks.iter().map(|(_, callback)| Arc::clone(callback)).collect())
            .unwrap_or_default();

        callbacks
            .into_iter()
            .filter(|callback| {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(payload)));
                if outcome.is_err() {
                    warn!(topic, "registry listener panicked");
                }
                outcome.is_ok()
            })
            .count()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Drop every registered callback.
    pub fn clear(&self) {
        self.lock().topics.clear();
    }
}

/// Registration handle returned by [`EventRegistry::subscribe`].
pub struct RegistrySubscription {
    topic: String,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for RegistrySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySubscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl RegistrySubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for RegistrySubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}
