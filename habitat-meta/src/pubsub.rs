use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Receives events in publish order.
///
/// `consume` runs on the publisher's task while the subscriber list is
/// locked: it must not block on work that needs the publisher, and it must
/// not add or remove subscribers. Slow work belongs on the subscriber's own
/// queue.
pub trait Subscriber<E>: Send + Sync {
    fn name(&self) -> &str;

    fn consume(&self, event: &E) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous single-topic fan-out.
pub struct Publisher<E> {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn Subscriber<E>>)>>,
}

impl<E> Default for Publisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Publisher<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber<E>>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!("Adding subscriber {}", subscriber.name());
        subscribers.push((id, subscriber));
        id
    }

    pub fn remove_subscriber(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Delivers `event` to every subscriber in registration order.
    /// A failing subscriber is logged and does not stop the fan-out.
    pub fn publish(&self, event: &E) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, subscriber) in subscribers.iter() {
            if let Err(error) = subscriber.consume(event) {
                tracing::warn!(
                    "Subscriber {} failed to consume event: {}",
                    subscriber.name(),
                    error
                );
            }
        }
    }
}
