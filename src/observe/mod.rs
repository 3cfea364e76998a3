//! Observable publishers.
//!
//! A [`Publisher`] is a threadsafe distributor of messages to its registered
//! observers. It is more lightweight than a stream: no flow control, no
//! batching, only fan-out with pause support. Publication runs through the
//! same serialized mailbox discipline as [`Actor`](crate::actor::Actor), so
//! concurrent publishers never interleave deliveries; observers should be
//! non-blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::actor::Actor;

pub(crate) type ObserverFn<T> = Arc<dyn Fn(T) -> anyhow::Result<()> + Send + Sync>;

/// A threadsafe one-to-many message distributor.
///
/// Cloning yields another handle to the same publisher.
pub struct Publisher<T> {
    actor: Actor<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    observers: RwLock<Vec<Registration<T>>>,
    publishing: AtomicBool,
}

struct Registration<T> {
    id: Uuid,
    observer: ObserverFn<T>,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            observers: RwLock::new(Vec::new()),
            publishing: AtomicBool::new(true),
        });
        let delivery = Arc::clone(&shared);
        let actor = Actor::new(move |message: T, done| {
            delivery.deliver(message);
            done.complete();
        });
        Publisher { actor, shared }
    }

    /// Queue a message for delivery to every registered observer.
    ///
    /// Delivery for one message completes before the next message starts,
    /// in registration order. While the publisher is paused the message is
    /// discarded, not queued.
    pub fn publish(&self, message: T) {
        self.actor.submit(message);
    }

    /// Register an observer and return the capability to unregister it.
    ///
    /// An observer returning `Err` is logged and does not stop delivery to
    /// the remaining observers; a panic aborts delivery of that message.
    pub fn subscribe<F>(&self, observer: F) -> Subscription<T>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(observer))
    }

    pub(crate) fn subscribe_arc(&self, observer: ObserverFn<T>) -> Subscription<T> {
        let id = Uuid::new_v4();
        self.shared
            .observers
            .write()
            .push(Registration { id, observer });
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Forward published messages into a channel, as a stream.
    ///
    /// The subscription unregisters itself once the receiving half is
    /// dropped.
    pub fn subscribe_channel(&self) -> UnboundedReceiverStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot: Arc<std::sync::OnceLock<Subscription<T>>> =
            Arc::new(std::sync::OnceLock::new());
        let hook = Arc::clone(&slot);
        let subscription = self.subscribe(move |message| {
            if tx.send(message).is_err() {
                if let Some(subscription) = hook.get() {
                    subscription.cancel();
                }
            }
            Ok(())
        });
        let _ = slot.set(subscription);
        UnboundedReceiverStream::new(rx)
    }

    pub fn is_publishing(&self) -> bool {
        self.shared.publishing.load(Ordering::Acquire)
    }

    pub fn set_publishing(&self, value: bool) {
        self.shared.publishing.store(value, Ordering::Release);
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().len()
    }
}

impl<T: Clone + Send + 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Shared<T> {
    fn deliver(&self, message: T) {
        if !self.publishing.load(Ordering::Acquire) {
            return;
        }
        // snapshot so concurrent subscribe/unsubscribe never corrupts an
        // in-progress broadcast
        let snapshot: Vec<ObserverFn<T>> = self
            .observers
            .read()
            .iter()
            .map(|registration| Arc::clone(&registration.observer))
            .collect();
        for observer in snapshot {
            if let Err(error) = observer(message.clone()) {
                log::error!("observer failed while handling published message: {error:#}");
            }
        }
    }
}

/// Capability to unregister an observer.
///
/// Dropping the subscription does not unregister; call
/// [`cancel`](Subscription::cancel) explicitly.
pub struct Subscription<T> {
    id: Uuid,
    shared: Weak<Shared<T>>,
}

impl<T> Subscription<T> {
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .observers
                .write()
                .retain(|registration| registration.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_stream::StreamExt;

    #[test]
    fn delivers_in_registration_order() {
        let publisher = Publisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |message: i32| {
                seen.lock().push((tag, message));
                Ok(())
            });
        }

        publisher.publish(1);
        publisher.publish(2);

        assert_eq!(
            seen.lock().clone(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
    }

    #[test]
    fn paused_publisher_discards() {
        let publisher = Publisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |message: &str| {
                seen.lock().push(message);
                Ok(())
            });
        }

        publisher.set_publishing(false);
        publisher.publish("dropped");
        publisher.set_publishing(true);
        publisher.publish("kept");

        assert_eq!(seen.lock().clone(), vec!["kept"]);
    }

    #[test]
    fn cancelled_subscription_stops_delivery() {
        let publisher = Publisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |message: i32| {
                seen.lock().push(message);
                Ok(())
            })
        };

        publisher.publish(1);
        subscription.cancel();
        publisher.publish(2);

        assert_eq!(seen.lock().clone(), vec![1]);
        assert_eq!(publisher.observer_count(), 0);
    }

    #[test]
    fn failing_observer_does_not_stop_the_broadcast() {
        let publisher = Publisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        publisher.subscribe(|_message: i32| Err(anyhow::anyhow!("observer broke")));
        {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |message: i32| {
                seen.lock().push(message);
                Ok(())
            });
        }

        publisher.publish(7);
        assert_eq!(seen.lock().clone(), vec![7]);
    }

    #[tokio::test]
    async fn channel_subscription_receives_messages() {
        let publisher = Publisher::new();
        let mut stream = publisher.subscribe_channel();

        publisher.publish("one");
        publisher.publish("two");

        assert_eq!(stream.next().await, Some("one"));
        assert_eq!(stream.next().await, Some("two"));
    }
}
