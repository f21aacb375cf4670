//! # Dispatcher
//!
//! In-process fan-out used twice in the pipeline: by the transport manager to
//! hand raw frames to its subscribers, and as the publication bus for derived
//! metrics and feed events.
//!
//! Three ways to subscribe:
//!
//! - [`Dispatcher::subscribe`] returns a [`Subscription`] backed by its own
//!   bounded queue. A subscriber that falls behind loses its oldest items and
//!   is told how many through [`Delivery::Dropped`]; nobody else is slowed
//!   down.
//! - [`Dispatcher::subscribe_inline`] registers a handler that runs on the
//!   publishing task, in publish order, before queued subscribers see the item.
//! - [`Dispatcher::subscribe_with`] runs a handler on its own task, fed by a
//!   bounded queue.
//!
//! The subscriber registry is the only structure mutated by several callers
//! and sits behind a mutex; handlers are never called with it held.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;

type InlineHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One receive outcome of a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Item(T),
    /// The subscriber lagged and this many oldest items were discarded.
    Dropped(u64),
    /// The dispatcher was closed.
    Closed,
}

enum Entry<T> {
    Queued { name: String },
    Inline { name: String, handler: InlineHandler<T> },
}

impl<T> Entry<T> {
    fn name(&self) -> &str {
        match self {
            Entry::Queued { name } | Entry::Inline { name, .. } => name,
        }
    }
}

struct Shared<T> {
    registry: Mutex<BTreeMap<u64, Entry<T>>>,
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

pub(crate) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Dispatcher<T: Clone + Send + Sync + 'static> {
    name: String,
    capacity: usize,
    next_id: AtomicU64,
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> Dispatcher<T> {
    /// `capacity` is the per-subscriber queue length before the oldest items
    /// are dropped.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            capacity,
            next_id: AtomicU64::new(1),
            shared: Arc::new(Shared {
                registry: Mutex::new(BTreeMap::new()),
                sender: Mutex::new(Some(sender)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a queued subscriber. After [`close`](Self::close) the returned
    /// subscription yields [`Delivery::Closed`] immediately.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<T> {
        let name = name.into();
        let id = self.next_id();
        let receiver = match lock(&self.shared.sender).as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        };
        lock(&self.shared.registry).insert(id, Entry::Queued { name: name.clone() });
        log::info!("Subscriber '{}' registered on {}", name, self.name);
        Subscription {
            id,
            name,
            receiver,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers a handler called synchronously from [`publish`](Self::publish).
    pub fn subscribe_inline<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = self.next_id();
        lock(&self.shared.registry).insert(
            id,
            Entry::Inline {
                name: name.clone(),
                handler: Arc::new(handler),
            },
        );
        log::info!("Inline subscriber '{}' registered on {}", name, self.name);

        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let guard = token.clone();
        tokio::spawn(async move {
            guard.cancelled().await;
            lock(&shared.registry).remove(&id);
        });
        SubscriptionHandle { id, name, token }
    }

    /// Runs `handler` on a dedicated task for every item, in publish order.
    /// Items the handler could not keep up with are dropped oldest-first and
    /// logged.
    pub fn subscribe_with<F>(&self, name: impl Into<String>, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut subscription = self.subscribe(name);
        let id = subscription.id;
        let name = subscription.name.clone();
        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    delivery = subscription.recv() => match delivery {
                        Delivery::Item(item) => handler(item),
                        Delivery::Dropped(_) => {}
                        Delivery::Closed => break,
                    }
                }
            }
        });
        SubscriptionHandle { id, name, token }
    }

    /// Delivers `item` to every subscriber. Returns the number of subscribers
    /// reached.
    pub fn publish(&self, item: T) -> usize {
        let handlers: Vec<InlineHandler<T>> = lock(&self.shared.registry)
            .values()
            .filter_map(|entry| match entry {
                Entry::Inline { handler, .. } => Some(Arc::clone(handler)),
                Entry::Queued { .. } => None,
            })
            .collect();
        for handler in &handlers {
            handler(&item);
        }

        let queued = match lock(&self.shared.sender).as_ref() {
            Some(sender) => sender.send(item).unwrap_or(0),
            None => 0,
        };
        handlers.len() + queued
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    pub fn subscriber_names(&self) -> Vec<String> {
        lock(&self.shared.registry)
            .values()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    /// Stops delivery. Queued subscribers drain what they hold, then see
    /// [`Delivery::Closed`]. Later publishes reach inline handlers only.
    pub fn close(&self) {
        if lock(&self.shared.sender).take().is_some() {
            log::info!("Dispatcher {} closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.sender).is_none()
    }
}

/// A queued subscription. Dropping it unsubscribes.
pub struct Subscription<T: Clone + Send + Sync + 'static> {
    id: u64,
    name: String,
    receiver: broadcast::Receiver<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Delivery<T> {
        match self.receiver.recv().await {
            Ok(item) => Delivery::Item(item),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                log::warn!(
                    "{}",
                    TransportError::DispatchOverflow {
                        subscriber: self.name.clone(),
                        dropped,
                    }
                );
                Delivery::Dropped(dropped)
            }
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }

    /// Non-blocking receive. `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        match self.receiver.try_recv() {
            Ok(item) => Some(Delivery::Item(item)),
            Err(broadcast::error::TryRecvError::Lagged(dropped)) => Some(Delivery::Dropped(dropped)),
            Err(broadcast::error::TryRecvError::Closed) => Some(Delivery::Closed),
            Err(broadcast::error::TryRecvError::Empty) => None,
        }
    }

    pub fn unsubscribe(self) {}
}

impl<T: Clone + Send + Sync + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        lock(&self.shared.registry).remove(&self.id);
        log::debug!("Subscriber '{}' unregistered", self.name);
    }
}

/// Handle of an inline or task-driven subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    name: String,
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_sees_items_in_order() {
        let dispatcher = Dispatcher::new("test", 16);
        let mut a = dispatcher.subscribe("a");
        let mut b = dispatcher.subscribe("b");
        for i in 0..5 {
            assert_eq!(dispatcher.publish(i), 2);
        }
        for i in 0..5 {
            assert_eq!(a.recv().await, Delivery::Item(i));
        }
        for i in 0..5 {
            assert_eq!(b.recv().await, Delivery::Item(i));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_without_stalling_others() {
        let dispatcher = Dispatcher::new("test", 4);
        let mut slow = dispatcher.subscribe("slow");
        let mut fast = dispatcher.subscribe("fast");

        for i in 0..10 {
            dispatcher.publish(i);
            assert_eq!(fast.recv().await, Delivery::Item(i));
        }

        assert_eq!(slow.recv().await, Delivery::Dropped(6));
        for i in 6..10 {
            assert_eq!(slow.recv().await, Delivery::Item(i));
        }
    }

    #[tokio::test]
    async fn inline_handlers_run_during_publish() {
        let dispatcher = Dispatcher::new("test", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = dispatcher.subscribe_inline("inline", move |item: &u32| {
            sink.lock().unwrap().push(*item);
        });

        dispatcher.publish(1);
        dispatcher.publish(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(dispatcher.subscriber_count(), 1);

        handle.unsubscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        dispatcher.publish(3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn task_subscriber_handles_items_until_unsubscribed() {
        let dispatcher = Dispatcher::new("test", 16);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = dispatcher.subscribe_with("worker", move |_item: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..3 {
            dispatcher.publish(i);
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.unsubscribe();
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_and_close_ends_streams() {
        let dispatcher: Dispatcher<u32> = Dispatcher::new("test", 4);
        let first = dispatcher.subscribe("first");
        let mut second = dispatcher.subscribe("second");
        assert_eq!(dispatcher.subscriber_count(), 2);
        first.unsubscribe();
        assert_eq!(dispatcher.subscriber_names(), vec!["second".to_string()]);

        dispatcher.publish(7);
        dispatcher.close();
        assert!(dispatcher.is_closed());
        assert_eq!(second.recv().await, Delivery::Item(7));
        assert_eq!(second.recv().await, Delivery::Closed);

        let mut late = dispatcher.subscribe("late");
        assert_eq!(late.recv().await, Delivery::Closed);
    }
}
