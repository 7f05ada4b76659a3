//! Event channel shared by all handlers
//!
//! A handler owns one [`EventChannel`] and emits lifecycle, message and error
//! events into it. Applications register with [`EventChannel::subscribe`] and
//! read events from the returned [`Subscription`]. Every subscriber gets its
//! own copy of every event emitted while it is registered. Events emitted with
//! no subscriber are dropped.
//!
//! Each subscriber has a bounded queue. [`EventChannel::emit`] waits until
//! every subscriber has room, so a subscriber that stops reading holds the
//! emitting task back instead of letting events pile up in memory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Events a subscriber may have queued before emitters wait
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Identifies one registration on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Senders<E> = Vec<(SubscriptionId, mpsc::Sender<E>)>;

struct Subscribers<E> {
    next_id: AtomicU64,
    capacity: usize,
    senders: Mutex<Senders<E>>,
}

impl<E> Subscribers<E> {
    fn lock(&self) -> MutexGuard<'_, Senders<E>> {
        // A panicking subscriber cannot leave the list half-updated
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: SubscriptionId) {
        self.lock().retain(|(sub, _)| *sub != id);
    }

    fn snapshot(&self) -> Senders<E> {
        self.lock().clone()
    }
}

/// Fan-out channel of handler events
pub struct EventChannel<E> {
    inner: Arc<Subscribers<E>>,
}

impl<E> Clone for EventChannel<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl<E> EventChannel<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Channel whose subscribers queue at most `capacity` events each
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Subscribers {
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                senders: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription<E> {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.lock().push((id, tx));
        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber by id; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.remove(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<E: Clone + Send + 'static> EventChannel<E> {
    /// Deliver an event to every current subscriber
    ///
    /// Waits while a subscriber's queue is full. Subscribers whose receiving
    /// side is gone are pruned. No lock is held while waiting.
    pub async fn emit(&self, event: E) {
        for (id, tx) in self.inner.snapshot() {
            if tx.send(event.clone()).await.is_err() {
                self.inner.remove(id);
            }
        }
    }

    /// Deliver an event without waiting
    ///
    /// For callers that cannot await. A subscriber whose queue is full gets
    /// the event from a background task instead, which may land it after
    /// events emitted later. Without a runtime the event is dropped for that
    /// subscriber.
    pub fn try_emit(&self, event: E) {
        let mut gone = Vec::new();
        for (id, tx) in self.inner.snapshot() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => gone.push(id),
                Err(TrySendError::Full(event)) => match Handle::try_current() {
                    Ok(rt) => {
                        rt.spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                    Err(_) => debug!(subscriber = %id, "Subscriber queue full, event dropped"),
                },
            }
        }
        if !gone.is_empty() {
            self.inner.lock().retain(|(id, _)| !gone.contains(id));
        }
    }
}

/// Receiving side of one registration
///
/// Dropping the subscription unregisters it.
pub struct Subscription<E> {
    id: SubscriptionId,
    rx: mpsc::Receiver<E>,
    channel: Weak<Subscribers<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the channel is gone and all queued events were read.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting to be read
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(self.id);
        }
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let channel: EventChannel<u32> = EventChannel::new();
        channel.emit(1).await;
        channel.try_emit(2);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let channel = EventChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.emit("first").await;
        channel.try_emit("second");

        assert_eq!(a.try_recv(), Some("first"));
        assert_eq!(a.try_recv(), Some("second"));
        assert_eq!(b.try_recv(), Some("first"));
        assert_eq!(b.try_recv(), Some("second"));
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let channel = EventChannel::new();
        channel.emit(1).await;
        let mut late = channel.subscribe();
        channel.emit(2).await;
        assert_eq!(late.try_recv(), Some(2));
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let channel: EventChannel<u8> = EventChannel::new();
        let first = channel.subscribe();
        let second = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        drop(first);
        assert_eq!(channel.subscriber_count(), 1);

        second.unsubscribe();
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id() {
        let channel = EventChannel::new();
        let mut sub = channel.subscribe();
        channel.unsubscribe(sub.id());
        channel.emit(7).await;
        assert_eq!(sub.try_recv(), None);
        // Unknown ids are ignored
        channel.unsubscribe(sub.id());
    }

    #[tokio::test]
    async fn test_subscription_outlives_channel() {
        let channel = EventChannel::new();
        let mut sub = channel.subscribe();
        channel.emit(5).await;
        drop(channel);
        assert_eq!(sub.try_recv(), Some(5));
        drop(sub);
    }

    #[tokio::test]
    async fn test_recv_across_tasks() {
        let channel = EventChannel::new();
        let mut sub = channel.subscribe();
        let emitter = channel.clone();
        tokio::spawn(async move {
            for i in 0..3 {
                emitter.emit(i).await;
            }
        });

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(sub.recv().await.unwrap());
        }
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_emit_waits_for_slow_subscriber() {
        let channel = EventChannel::with_capacity(2);
        let mut sub = channel.subscribe();
        channel.emit(1).await;
        channel.emit(2).await;
        assert_eq!(sub.queued(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(100), channel.emit(3)).await;
        assert!(blocked.is_err(), "emit should wait while the queue is full");
        assert_eq!(sub.queued(), 2);

        let emitter = channel.clone();
        let pending = tokio::spawn(async move { emitter.emit(3).await });
        assert_eq!(sub.recv().await, Some(1));
        pending.await.unwrap();
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_try_emit_on_full_queue_still_delivers() {
        let channel = EventChannel::with_capacity(1);
        let mut sub = channel.subscribe();
        channel.try_emit(1);
        channel.try_emit(2);

        assert_eq!(sub.recv().await, Some(1));
        let late = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(late.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_emit_prunes_dropped_subscriber() {
        let channel = EventChannel::with_capacity(1);
        let sub = channel.subscribe();
        let mut kept = channel.subscribe();
        drop(sub);
        channel.emit(1).await;
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Some(1));
    }

    #[test]
    fn test_try_emit_without_runtime_drops_when_full() {
        let channel = EventChannel::with_capacity(1);
        let mut sub = channel.subscribe();
        channel.try_emit(1);
        channel.try_emit(2);
        assert_eq!(sub.try_recv(), Some(1));
        assert_eq!(sub.try_recv(), None);
    }
}
