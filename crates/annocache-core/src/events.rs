//! Change notification
//!
//! An explicit observer registry owned by the cache. Each subscriber gets
//! its own unbounded Tokio channel, so emitting is synchronous, never
//! blocks, and never drops an event for a slow subscriber. Delivery order
//! across subscribers is subscription order.
//!
//! ```ignore
//! let mut events = cache.subscribe();
//! cache.create(annotation);
//! while let Some(event) = events.try_recv() {
//!     println!("{}", event.kind());
//! }
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::models::{Annotation, Snapshot};

/// A change to the cached sequence
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The sequence was replaced by a backend load
    Load(Snapshot),
    /// An annotation was appended
    Created(Annotation),
    /// An annotation was replaced in place
    Updated(Annotation),
    /// An annotation was removed
    Deleted(Annotation),
    /// The full sequence after a create/update/delete
    NewState(Snapshot),
    /// A failed propagation restored this earlier sequence
    Rollback(Snapshot),
}

impl CacheEvent {
    /// Which kind of event this is
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::Load(_) => EventKind::Load,
            CacheEvent::Created(_) => EventKind::Created,
            CacheEvent::Updated(_) => EventKind::Updated,
            CacheEvent::Deleted(_) => EventKind::Deleted,
            CacheEvent::NewState(_) => EventKind::NewState,
            CacheEvent::Rollback(_) => EventKind::Rollback,
        }
    }

    /// The single annotation carried by created/updated/deleted events
    pub fn annotation(&self) -> Option<&Annotation> {
        match self {
            CacheEvent::Created(a) | CacheEvent::Updated(a) | CacheEvent::Deleted(a) => Some(a),
            _ => None,
        }
    }

    /// The full sequence carried by load/newState/rollback events
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            CacheEvent::Load(s) | CacheEvent::NewState(s) | CacheEvent::Rollback(s) => Some(s),
            _ => None,
        }
    }
}

/// Event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Load,
    Created,
    Updated,
    Deleted,
    NewState,
    Rollback,
}

impl EventKind {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Load => "load",
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::NewState => "newState",
            EventKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Filter<T> = Box<dyn Fn(&T) -> bool + Send>;

struct Subscriber<T> {
    id: u64,
    filter: Option<Filter<T>>,
    tx: mpsc::UnboundedSender<T>,
}

struct RegistryInner<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// Registry of subscribers for one event type
pub struct EventRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: Clone + Send + 'static> EventRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Receive only events matching `filter`
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        self.register(Some(Box::new(filter)))
    }

    fn register(&self, filter: Option<Filter<T>>) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, filter, tx });
        trace!(subscriber = id, "Subscriber registered");

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every matching subscriber, in subscription order
    ///
    /// Returns the number of subscribers it was delivered to. Subscribers
    /// whose receiving side is gone are pruned.
    pub fn emit(&self, event: &T) -> usize {
        let mut inner = lock(&self.inner);
        let mut delivered = 0;
        inner.subscribers.retain(|subscriber| {
            if let Some(filter) = &subscriber.filter {
                if !filter(event) {
                    return !subscriber.tx.is_closed();
                }
            }
            match subscriber.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }
}

impl<T: Clone + Send + 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = lock(&self.inner).subscribers.len();
        f.debug_struct("EventRegistry")
            .field("subscribers", &count)
            .finish()
    }
}

/// Handle to one registration
///
/// Dropping it unsubscribes. It is also a [`Stream`] of events.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    registry: Weak<Mutex<RegistryInner<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event
    ///
    /// Returns `None` once the registry is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event without waiting
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.retain(|s| s.id != self.id);
            trace!(subscriber = self.id, "Subscriber removed");
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Current snapshot followed by every later `load` snapshot
///
/// Created by `AnnotationsCache::annotations`. Only loads are forwarded;
/// fine-grained changes and rollbacks are on the event channel.
#[derive(Debug)]
pub struct SnapshotStream {
    initial: Option<Snapshot>,
    loads: Subscription<CacheEvent>,
}

impl SnapshotStream {
    pub(crate) fn new(initial: Snapshot, loads: Subscription<CacheEvent>) -> Self {
        Self {
            initial: Some(initial),
            loads,
        }
    }

    /// Wait for the next snapshot
    pub async fn next(&mut self) -> Option<Snapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.loads.recv().await? {
                CacheEvent::Load(snapshot) => return Some(snapshot),
                _ => continue,
            }
        }
    }

    /// Take the next snapshot without waiting
    pub fn try_next(&mut self) -> Option<Snapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        while let Some(event) = self.loads.try_recv() {
            if let CacheEvent::Load(snapshot) = event {
                return Some(snapshot);
            }
        }
        None
    }
}

impl Stream for SnapshotStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        if let Some(initial) = self.initial.take() {
            return Poll::Ready(Some(initial));
        }
        loop {
            match Pin::new(&mut self.loads).poll_next(cx) {
                Poll::Ready(Some(CacheEvent::Load(snapshot))) => {
                    return Poll::Ready(Some(snapshot))
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_emit_without_subscriber() {
        let registry: EventRegistry<u32> = EventRegistry::new();
        assert_eq!(registry.emit(&1), 0);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_multi_subscribers_receive_in_order() {
        let registry = EventRegistry::new();
        let mut first = registry.subscribe();
        let mut second = registry.subscribe();

        assert_eq!(registry.emit(&1), 2);
        assert_eq!(registry.emit(&2), 2);

        assert_eq!(first.drain(), vec![1, 2]);
        assert_eq!(second.drain(), vec![1, 2]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = EventRegistry::new();
        let sub = registry.subscribe();
        let _other = registry.subscribe();
        assert_eq!(registry.subscriber_count(), 2);

        drop(sub);
        assert_eq!(registry.subscriber_count(), 1);

        assert_eq!(registry.emit(&"x"), 1);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let registry = EventRegistry::new();
        let sub = registry.subscribe();
        sub.unsubscribe();
        assert_eq!(registry.emit(&0u8), 0);
    }

    #[test]
    fn test_filtered_subscription() {
        let registry = EventRegistry::new();
        let mut evens = registry.subscribe_filtered(|n: &u32| n % 2 == 0);

        for n in 1..=6 {
            registry.emit(&n);
        }
        assert_eq!(evens.drain(), vec![2, 4, 6]);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = EventRegistry::new();
        let mut sub = registry.subscribe();
        registry.emit(&7);
        drop(registry);

        assert_eq!(sub.try_recv(), Some(7));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_subscription_is_a_stream() {
        let registry = EventRegistry::new();
        let sub = registry.subscribe();
        registry.emit(&1);
        registry.emit(&2);
        drop(registry);

        let received: Vec<i32> = sub.collect().await;
        assert_eq!(received, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_snapshot_stream_forwards_loads_only() {
        let registry = EventRegistry::new();
        let initial: Snapshot = Arc::new(vec![Annotation::with_url("a", "p1", "")]);
        let loaded: Snapshot = Arc::new(vec![Annotation::with_url("x", "p2", "")]);

        let mut stream = SnapshotStream::new(
            initial.clone(),
            registry.subscribe_filtered(|e: &CacheEvent| e.kind() == EventKind::Load),
        );

        registry.emit(&CacheEvent::NewState(Arc::new(Vec::new())));
        registry.emit(&CacheEvent::Load(loaded.clone()));

        assert_eq!(stream.next().await, Some(initial));
        assert_eq!(stream.next().await, Some(loaded));
        assert_eq!(stream.try_next(), None);
    }

    #[test]
    fn test_event_accessors() {
        let a = Annotation::with_url("a", "p1", "");
        let created = CacheEvent::Created(a.clone());
        assert_eq!(created.kind(), EventKind::Created);
        assert_eq!(created.annotation(), Some(&a));
        assert!(created.snapshot().is_none());

        let state = CacheEvent::NewState(Arc::new(vec![a]));
        assert_eq!(state.kind().to_string(), "newState");
        assert_eq!(state.snapshot().map(|s| s.len()), Some(1));
    }
}
