//! Generic subscriber-channel event bus.
//!
//! Grounded in the corpus's filter-per-subscriber event hub pattern, but
//! with no GUI framework underneath it: publishing is a plain `send` over an
//! independent `mpsc` channel per subscriber, so one slow or dropped
//! subscriber can never block or lag another. A bus with zero subscribers is
//! a normal, common state (nothing has attached yet, or everyone detached).

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

type Filter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct Subscriber<E> {
    id: Uuid,
    filter: Option<Filter<E>>,
    tx: mpsc::UnboundedSender<E>,
}

/// A live subscription. Dropping it unsubscribes (the bus notices on the
/// next `send` because the paired receiver is gone and prunes it then).
pub struct Subscription<E> {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<E>,
    bus: EventBus<E>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        self.bus.remove(self.id);
    }
}

/// Cloneable publish/subscribe handle. Clones share the same subscriber
/// list; the bus itself has no ownership over Session/ForwardRegistry/
/// Supervisor (per the ownership model, "the Event bus has no ownership").
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<Subscriber<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to every event, or only events matching `filter` if given.
    pub fn subscribe(&self, filter: Option<Filter<E>>) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.lock().push(Subscriber { id, filter, tx });
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    fn remove(&self, id: Uuid) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Publish an event to every subscriber whose filter accepts it.
    /// Must be called from the task performing the state transition, never
    /// from inside a lock guarding that state.
    pub fn send(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            let accepted = subscriber.filter.as_ref().map_or(true, |f| f(&event));
            if !accepted {
                return true;
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_with_no_subscribers_is_a_noop() {
        let bus: EventBus<u32> = EventBus::new();
        bus.send(1);
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus: EventBus<u32> = EventBus::new();
        let mut sub = bus.subscribe(None);
        bus.send(42);
        assert_eq!(sub.recv().await, Some(42));
    }

    #[tokio::test]
    async fn filter_narrows_delivered_events() {
        let bus: EventBus<u32> = EventBus::new();
        let mut evens = bus.subscribe(Some(Box::new(|n: &u32| n % 2 == 0)));
        bus.send(1);
        bus.send(2);
        assert_eq!(evens.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_send() {
        let bus: EventBus<u32> = EventBus::new();
        {
            let _sub = bus.subscribe(None);
            assert_eq!(bus.subscriber_count(), 1);
        }
        bus.send(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_event() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe(None);
        let mut b = bus.subscribe(None);
        bus.send(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }
}
