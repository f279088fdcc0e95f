//! Coarse change notification for replicas.
//!
//! Subscribers are told *that* something changed, never *what*; they re-read
//! whatever state they care about.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    /// Create a new unique subscription ID
    pub fn new() -> Self {
        Self(SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

type Callback = Box<dyn FnMut() + Send + Sync>;

/// Registry of change callbacks, notified in subscription order.
#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: Vec<(SubscriptionId, Callback)>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Returns false if the subscription was not registered here.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Detach every subscriber.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn notify(&mut self) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_notify_reaches_every_subscriber() {
        let mut notifier = ChangeNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            notifier.subscribe(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        notifier.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribe() {
        let mut notifier = ChangeNotifier::new();
        let id = notifier.subscribe(|| {});
        assert_eq!(notifier.len(), 1);

        assert!(notifier.unsubscribe(id));
        assert!(notifier.is_empty());

        // Double unsubscribe returns false
        assert!(!notifier.unsubscribe(id));
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let a = SubscriptionId::new();
        let b = SubscriptionId::new();
        assert_ne!(a, b);
    }
}
