//! Minimal publish/subscribe channel used for change notification.
//!
//! The tree and covariance objects own a [`Subject`] each; external
//! consumers (GUI, plots, exporters) register callbacks and are notified
//! on structural, leaf-set, and config changes. The channel knows nothing
//! about its subscribers beyond the callback itself.

/// What changed in the owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The physical tree was rebuilt (correction change).
    TreeRebuilt,
    /// The reported leaf set changed (epsilon, NaN allowance, size bounds).
    LeavesChanged,
    /// Configuration changed without affecting the leaf set.
    ConfigChanged,
    /// Derived covariance state was invalidated (new noise data etc.).
    CovarianceCleared,
}

/// Token returned by [`Subject::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(usize);

type Callback = Box<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback registry with stable subscriber tokens.
#[derive(Default)]
pub struct Subject {
    subscribers: Vec<(SubscriberId, Callback)>,
    next_id: usize,
}

impl Subject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; returns a token for later removal.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriberId
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Remove a previously registered callback. Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Invoke every subscriber with the event, in registration order.
    pub fn notify(&self, event: ChangeEvent) {
        for (_, callback) in &self.subscribers {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl std::fmt::Debug for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notify_reaches_all_subscribers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subject = Subject::new();
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            subject.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        subject.notify(ChangeEvent::LeavesChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subject = Subject::new();
        let hits2 = Arc::clone(&hits);
        let token = subject.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        subject.unsubscribe(token);
        subject.notify(ChangeEvent::TreeRebuilt);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(subject.is_empty());
    }
}
