//! Caller-facing handles for in-flight calls

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use super::{CallError, CallResult, Shared};
use crate::protocol::TxId;

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CallError> {
    T::deserialize(value).map_err(|e| CallError::Decode(e.to_string()))
}

/// Future resolving to the single reply of a unary call.
///
/// Dropping it before it resolves removes the registration.
pub struct UnaryCall<T> {
    tx_id: TxId,
    rx: oneshot::Receiver<CallResult>,
    shared: Arc<Shared>,
    resolved: bool,
    _response: PhantomData<fn() -> T>,
}

impl<T> UnaryCall<T> {
    pub(super) fn new(tx_id: TxId, rx: oneshot::Receiver<CallResult>, shared: Arc<Shared>) -> Self {
        Self {
            tx_id,
            rx,
            shared,
            resolved: false,
            _response: PhantomData,
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    /// Stop waiting; the call resolves to [`CallError::Cancelled`]
    pub fn cancel(&mut self) {
        if let Some(call) = self.shared.take(&self.tx_id) {
            call.cancel();
        }
    }
}

impl<T: DeserializeOwned> Future for UnaryCall<T> {
    type Output = Result<T, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(CallError::Cancelled),
        };
        self.resolved = true;
        Poll::Ready(result.and_then(decode))
    }
}

impl<T> Drop for UnaryCall<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared.take(&self.tx_id);
        }
    }
}

struct StreamHandle {
    tx_id: TxId,
    shared: Arc<Shared>,
    cancelled: AtomicBool,
}

impl StreamHandle {
    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.unsubscribe(&self.tx_id)
    }
}

/// Cancels a [`CallStream`] from elsewhere
#[derive(Clone)]
pub struct StreamCanceller(Arc<StreamHandle>);

impl StreamCanceller {
    /// Returns `true` only for the attempt that sent the unsubscribe
    pub fn cancel(&self) -> bool {
        self.0.cancel()
    }
}

/// Items pushed by the server for a streaming call.
///
/// Items that fail to decode are logged and skipped. A remote error is yielded
/// once, then the stream ends. Dropping the stream unsubscribes.
pub struct CallStream<T> {
    rx: mpsc::UnboundedReceiver<CallResult>,
    handle: Arc<StreamHandle>,
    current: Option<T>,
}

impl<T> CallStream<T> {
    pub(super) fn new(tx_id: TxId, rx: mpsc::UnboundedReceiver<CallResult>, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            handle: Arc::new(StreamHandle {
                tx_id,
                shared,
                cancelled: AtomicBool::new(false),
            }),
            current: None,
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.handle.tx_id
    }

    /// Most recent item received
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Unsubscribe. Returns `false` if the stream was already cancelled or
    /// had already ended.
    pub fn cancel(&mut self) -> bool {
        self.handle.cancel()
    }

    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller(Arc::clone(&self.handle))
    }
}

impl<T> Unpin for CallStream<T> {}

impl<T: DeserializeOwned + Clone> Stream for CallStream<T> {
    type Item = Result<T, CallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let value = match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Some(Ok(value))) => value,
            };

            match decode::<T>(value) {
                Ok(item) => {
                    self.current = Some(item.clone());
                    return Poll::Ready(Some(Ok(item)));
                }
                Err(e) => log::debug!("Skipping stream item for {}: {}", self.handle.tx_id, e),
            }
        }
    }
}

impl<T> Drop for CallStream<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

