//! Lossy one-to-many change notifications
//!
//! A [`Notifier`] fans a stream of values out to any number of
//! dynamically added and removed subscribers, without backpressure ever
//! reaching the producer: [`Notifier::trigger`] never blocks and never
//! waits for a slow subscriber.
//!
//! The price is loss. A subscriber whose buffer is full misses the value,
//! so consumers must treat the stream as a wake-up signal and re-read
//! authoritative state, rather than reconstruct it from deltas.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::debug;

const LOG_TARGET: &str = "agora::notify";

struct NotifierInner<T> {
    next_id: u64,
    subscribers: BTreeMap<u64, mpsc::Sender<T>>,
}

/// Single-producer, multi-subscriber fan-out with per-subscriber loss
pub struct Notifier<T> {
    inner: Arc<Mutex<NotifierInner<T>>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Notifier<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Notifier<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotifierInner {
                next_id: 0,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// Add a subscriber with a buffer of `capacity` values
    ///
    /// Values triggered while the buffer is full are dropped for this
    /// subscriber only.
    pub fn subscribe(&self, capacity: usize) -> NotifySub<T> {
        let (tx, rx) = mpsc::channel(capacity);

        let mut inner = self.inner.lock().expect("Locking failed");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);

        NotifySub {
            rx,
            notifier: Arc::downgrade(&self.inner),
            id,
            cancelled: false,
        }
    }

    /// Deliver `value` to every current subscriber, without blocking
    ///
    /// Subscribers that went away are pruned; subscribers with a full
    /// buffer are skipped.
    pub fn trigger(&self, value: T) {
        let mut inner = self.inner.lock().expect("Locking failed");

        let mut gone = vec![];
        for (id, tx) in &inner.subscribers {
            match tx.try_send(value.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(target: LOG_TARGET, subscriber = id, "Subscriber lagging, dropping value");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    gone.push(*id);
                }
            }
        }

        for id in gone {
            inner.subscribers.remove(&id);
        }
    }

    /// Number of live subscribers (for tests and introspection)
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("Locking failed").subscribers.len()
    }
}

/// A subscription handle: a receiver plus its cancellation
///
/// Dropping the handle cancels the subscription.
pub struct NotifySub<T> {
    rx: mpsc::Receiver<T>,
    notifier: Weak<Mutex<NotifierInner<T>>>,
    id: u64,
    cancelled: bool,
}

impl<T> NotifySub<T> {
    /// Receive the next value, `None` once cancelled or the notifier is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Remove this subscriber; idempotent
    ///
    /// Triggers that race with the cancellation are either fully delivered
    /// or not at all; nothing arrives after `cancel` returns and the
    /// buffered backlog is discarded.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;

        if let Some(inner) = self.notifier.upgrade() {
            inner
                .lock()
                .expect("Locking failed")
                .subscribers
                .remove(&self.id);
        }
        self.rx.close();
        // Drain anything that landed before the removal took effect.
        while self.rx.try_recv().is_ok() {}
    }
}

impl<T> Drop for NotifySub<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests;
