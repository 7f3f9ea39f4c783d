//! Client side of the transaction layer
//!
//! [`RpcClient`] issues calls and is cheap to clone; [`ClientConnection`] owns
//! the outgoing queue and drives one transport session at a time. Both share a
//! pending-call table keyed by transaction id.

mod call;
mod player;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Envelope, TxId, qualify};
use crate::transport::{MessageTransport, Reconnect, TransportConnector, TransportError};

pub use call::{CallStream, StreamCanceller, UnaryCall};
pub use player::{PlayerClient, PlayerMonitor, PlayerSnapshot};

/// Why a call did not produce a value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Call was cancelled")]
    Cancelled,
    #[error("Remote handler failed: {0}")]
    Remote(String),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

type CallResult = Result<Value, CallError>;

/// A registered call awaiting replies
enum PendingCall {
    Unary(oneshot::Sender<CallResult>),
    Stream(mpsc::UnboundedSender<CallResult>),
}

impl PendingCall {
    fn cancel(self) {
        // The caller may already be gone; nothing to tell it then
        match self {
            PendingCall::Unary(tx) => {
                let _ = tx.send(Err(CallError::Cancelled));
            }
            PendingCall::Stream(tx) => {
                let _ = tx.send(Err(CallError::Cancelled));
            }
        }
    }
}

struct Shared {
    pending: Mutex<HashMap<TxId, PendingCall>>,
    outgoing: mpsc::UnboundedSender<Envelope>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<TxId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and queue its request in one critical section.
    ///
    /// Returns the call back if the client is closed or the connection is gone.
    fn register(&self, envelope: Envelope, call: PendingCall) -> Result<(), PendingCall> {
        let mut pending = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(call);
        }

        let tx_id = envelope.tx_id.clone();
        if self.outgoing.send(envelope).is_err() {
            return Err(call);
        }
        pending.insert(tx_id, call);
        Ok(())
    }

    fn take(&self, tx_id: &TxId) -> Option<PendingCall> {
        self.lock().remove(tx_id)
    }

    /// Queue the unsubscribe for a live stream, then drop its registration.
    /// Does nothing if the stream is no longer registered.
    fn unsubscribe(&self, tx_id: &TxId) -> bool {
        let mut pending = self.lock();
        if !matches!(pending.get(tx_id), Some(PendingCall::Stream(_))) {
            return false;
        }

        if self.outgoing.send(Envelope::unsubscribe(tx_id.clone())).is_err() {
            log::debug!("Connection gone, unsubscribe for {} not sent", tx_id);
        }
        pending.remove(tx_id);
        true
    }

    /// Route one incoming frame to its pending call
    fn dispatch(&self, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Dropping malformed envelope: {}", e);
                return;
            }
        };

        if let Some(method) = &envelope.method {
            log::debug!("Ignoring incoming call to {} on the client side", method);
            return;
        }

        let result = match (envelope.error, envelope.message) {
            (Some(error), _) => Err(CallError::Remote(error)),
            (None, Some(message)) => Ok(message),
            (None, None) => Ok(Value::Object(Map::new())),
        };

        let mut pending = self.lock();
        let Some(call) = pending.remove(&envelope.tx_id) else {
            log::debug!("No pending call for {}, dropping reply", envelope.tx_id);
            return;
        };

        match call {
            PendingCall::Unary(tx) => {
                let _ = tx.send(result);
            }
            PendingCall::Stream(tx) => {
                let failed = result.is_err();
                if tx.send(result).is_ok() && !failed {
                    pending.insert(envelope.tx_id, PendingCall::Stream(tx));
                }
            }
        }
    }

    /// Force-cancel every pending call and discard requests queued for the
    /// session that just ended
    fn teardown(&self, queue: &mut mpsc::UnboundedReceiver<Envelope>) -> usize {
        let cancelled: Vec<PendingCall> = {
            let mut pending = self.lock();
            while queue.try_recv().is_ok() {}
            pending.drain().map(|(_, call)| call).collect()
        };

        let count = cancelled.len();
        for call in cancelled {
            call.cancel();
        }
        count
    }

    /// Close for good with no connection left to flush through: later calls
    /// resolve as cancelled and every pending call is cancelled now
    fn abandon(&self) -> usize {
        let cancelled: Vec<PendingCall> = {
            let mut pending = self.lock();
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().map(|(_, call)| call).collect()
        };

        let count = cancelled.len();
        for call in cancelled {
            call.cancel();
        }
        count
    }

    fn close(&self) {
        let calls: Vec<(TxId, PendingCall)> = {
            let mut pending = self.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let calls: Vec<_> = pending.drain().collect();
            for (tx_id, call) in &calls {
                if matches!(call, PendingCall::Stream(_)) {
                    let _ = self.outgoing.send(Envelope::unsubscribe(tx_id.clone()));
                }
            }
            calls
        };

        for (_, call) in calls {
            call.cancel();
        }
        self.shutdown.cancel();
    }
}

/// Handle for issuing calls over the bridge
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
    prefix: Arc<str>,
}

impl RpcClient {
    /// Create a client and the connection that must be driven for calls to
    /// go anywhere
    pub fn new(prefix: impl Into<String>) -> (RpcClient, ClientConnection) {
        let (outgoing, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            outgoing,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let client = RpcClient {
            shared: Arc::clone(&shared),
            prefix: Arc::from(prefix.into()),
        };
        (client, ClientConnection { shared, queue })
    }

    /// Issue a single-result call
    pub fn unary<Req, Resp>(&self, method: &str, request: &Req) -> UnaryCall<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let tx_id = TxId::new();
        let (tx, rx) = oneshot::channel();

        match serde_json::to_value(request) {
            Ok(message) => {
                let envelope = Envelope::call(tx_id.clone(), qualify(&self.prefix, method), message);
                if let Err(call) = self.shared.register(envelope, PendingCall::Unary(tx)) {
                    call.cancel();
                }
            }
            Err(e) => {
                let _ = tx.send(Err(CallError::Encode(e.to_string())));
            }
        }

        log::debug!("Issued {} as {}", method, tx_id);
        UnaryCall::new(tx_id, rx, Arc::clone(&self.shared))
    }

    /// Issue a streaming call
    pub fn stream<Req, Item>(&self, method: &str, request: &Req) -> CallStream<Item>
    where
        Req: Serialize,
        Item: DeserializeOwned + Clone,
    {
        let tx_id = TxId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        match serde_json::to_value(request) {
            Ok(message) => {
                let envelope = Envelope::call(tx_id.clone(), qualify(&self.prefix, method), message);
                if let Err(call) = self.shared.register(envelope, PendingCall::Stream(tx)) {
                    call.cancel();
                }
            }
            Err(e) => {
                let _ = tx.send(Err(CallError::Encode(e.to_string())));
            }
        }

        log::debug!("Subscribed to {} as {}", method, tx_id);
        CallStream::new(tx_id, rx, Arc::clone(&self.shared))
    }

    /// Unsubscribe every live stream, cancel every unary call and stop the
    /// connection once the queue is flushed. Later calls resolve as cancelled.
    pub fn shutdown(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting replies
    pub fn pending_calls(&self) -> usize {
        self.shared.lock().len()
    }
}

/// How a client session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the transport
    Closed,
    /// Reading or writing the transport failed
    Failed(String),
    /// [`RpcClient::shutdown`] was called
    Shutdown,
}

/// Drives the client's outgoing queue and incoming replies over transports
pub struct ClientConnection {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedReceiver<Envelope>,
}

impl ClientConnection {
    /// Serve one transport until it closes or the client shuts down.
    ///
    /// Every call still pending when the session ends is cancelled.
    pub async fn run_session<T: MessageTransport>(&mut self, transport: T) -> SessionEnd {
        let (mut sink, mut stream) = transport.split();

        let end = loop {
            tokio::select! {
                biased;
                Some(envelope) = self.queue.recv() => {
                    let frame = match envelope.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("Failed to encode envelope {}: {}", envelope.tx_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(frame).await {
                        break SessionEnd::Failed(e.to_string());
                    }
                }
                _ = self.shared.shutdown.cancelled() => {
                    while let Ok(envelope) = self.queue.try_recv() {
                        if let Ok(frame) = envelope.encode()
                            && let Err(e) = sink.feed(frame).await
                        {
                            log::warn!("Failed to flush queued envelope: {}", e);
                            break;
                        }
                    }
                    if let Err(e) = sink.close().await {
                        log::debug!("Transport close on shutdown: {}", e);
                    }
                    break SessionEnd::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => self.shared.dispatch(&frame),
                    Some(Err(e)) => break SessionEnd::Failed(e.to_string()),
                    None => break SessionEnd::Closed,
                },
            }
        };

        let cancelled = self.shared.teardown(&mut self.queue);
        if cancelled > 0 {
            log::info!("Client session ended ({:?}), cancelled {} pending calls", end, cancelled);
        } else {
            log::debug!("Client session ended ({:?})", end);
        }
        end
    }

    /// Open sessions through `connector` until the client shuts down.
    ///
    /// Fails only when `retry` gives up on reaching the peer.
    pub async fn run<C: TransportConnector>(
        mut self,
        mut connector: C,
        mut retry: Reconnect,
    ) -> Result<(), TransportError> {
        let shutdown = self.shared.shutdown.clone();

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = connector.connect() => connected,
            };

            match connected {
                Ok(transport) => {
                    retry.succeeded();
                    log::info!("Client connected via {}", connector.describe());
                    if self.run_session(transport).await == SessionEnd::Shutdown {
                        return Ok(());
                    }
                    log::warn!("Client lost {}, reconnecting", connector.describe());
                }
                Err(e) => {
                    if let Err(gave_up) = retry.failed(e, &connector.describe()).await {
                        let cancelled = self.shared.abandon();
                        log::error!("{}; cancelled {} pending calls", gave_up, cancelled);
                        return Err(gave_up);
                    }
                }
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let cancelled = self.shared.abandon();
        if cancelled > 0 {
            log::info!("Client connection dropped, cancelled {} pending calls", cancelled);
        }
    }
}
