//! Last-value broadcast
//!
//! A [`LastValue`] remembers the most recent emission and hands it to every new
//! subscriber before any later emission. Listeners whose receiving side is gone
//! are pruned on the next publish.

use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct Listener<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct Inner<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
    next_id: u64,
}

/// Observable holding the last published value
pub struct LastValue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for LastValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for LastValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> LastValue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: None,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Start with a known value
    pub fn with_value(value: T) -> Self {
        let last = Self::new();
        lock(&last.inner).value = Some(value);
        last
    }

    /// Store `value` and deliver it to every live listener
    pub fn publish(&self, value: T) {
        let mut inner = lock(&self.inner);
        inner.listeners.retain(|listener| listener.tx.send(value.clone()).is_ok());
        inner.value = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.inner).value.clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Subscribe, receiving the current value first if there is one
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        if let Some(value) = &inner.value {
            // Receiver is alive, so this cannot fail
            let _ = tx.send(value.clone());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push(Listener { id, tx });

        Subscription {
            id,
            rx,
            owner: Some(Arc::downgrade(&self.inner)),
        }
    }
}

/// Receiving end of a [`LastValue`] subscription
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    owner: Option<Weak<Mutex<Inner<T>>>>,
}

impl<T> Subscription<T> {
    /// Next value, or `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn is_subscribed(&self) -> bool {
        self.owner.is_some()
    }

    /// Stop receiving. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };

        if let Some(inner) = owner.upgrade() {
            lock(&inner).listeners.retain(|listener| listener.id != self.id);
        }
        self.rx.close();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Publish every `Ok` item of `stream` into `target` until the stream ends or
/// yields an error. Returns how many values were forwarded.
pub async fn forward<S, T, E>(mut stream: S, target: LastValue<T>) -> usize
where
    S: Stream<Item = Result<T, E>> + Unpin,
    T: Clone,
    E: Display,
{
    let mut forwarded = 0;
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                target.publish(value);
                forwarded += 1;
            }
            Err(e) => {
                log::warn!("Stopped forwarding stream after {} items: {}", forwarded, e);
                break;
            }
        }
    }
    forwarded
}
