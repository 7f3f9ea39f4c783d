//! Server side of the transaction layer
//!
//! The [`Dispatcher`] maps method names to handlers and serves one transport
//! session at a time, reconnecting through a [`TransportConnector`] when a
//! session ends.

mod handler;
mod session;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

use crate::protocol::{DEFAULT_SERVICE_PREFIX, unqualify};
use crate::transport::{MessageTransport, Reconnect, TransportConnector, TransportError};

pub use handler::{Handler, HandlerError, ItemStream, UnaryFuture};
pub use session::SessionSummary;

/// What to do with a call naming a method nobody registered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownMethodPolicy {
    /// Drop the call without replying
    #[default]
    Ignore,
    /// Reply with an error envelope
    Reject,
}

/// Routes incoming calls to registered handlers
#[derive(Debug)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    prefix: String,
    unknown_methods: UnknownMethodPolicy,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_PREFIX)
    }
}

impl Dispatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            handlers: HashMap::new(),
            prefix: prefix.into(),
            unknown_methods: UnknownMethodPolicy::default(),
        }
    }

    pub fn with_unknown_methods(mut self, policy: UnknownMethodPolicy) -> Self {
        self.unknown_methods = policy;
        self
    }

    /// Register a handler under an unqualified method name, replacing any
    /// previous one
    pub fn register(&mut self, method: impl Into<String>, handler: Handler) {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_some() {
            log::warn!("Replaced handler for {}", method);
        }
    }

    pub fn register_unary<Req, Resp, F, Fut>(&mut self, method: &str, f: F)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.register(method, Handler::unary(f));
    }

    pub fn register_stream<Req, Item, F, S>(&mut self, method: &str, f: F)
    where
        Req: DeserializeOwned,
        Item: Serialize,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Item, HandlerError>> + Send + 'static,
    {
        self.register(method, Handler::stream(f));
    }

    /// Resolve a method name as it appears on the wire.
    ///
    /// `Err` carries the unqualified name when it belongs to this service but
    /// has no handler; `Ok(None)` means the name belongs to another service.
    pub fn resolve<'a>(&self, method: &'a str) -> Result<Option<&Handler>, &'a str> {
        match unqualify(&self.prefix, method) {
            None => Ok(None),
            Some(name) => self.handlers.get(name).map(Some).ok_or(name),
        }
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Serve one transport until the peer goes away
    pub async fn serve_session<T: MessageTransport>(&self, transport: T) -> SessionSummary {
        session::run(self, transport).await
    }

    /// Serve sessions from `connector` forever.
    ///
    /// Returns only when `retry` gives up on obtaining a session.
    pub async fn serve<C: TransportConnector>(
        &self,
        mut connector: C,
        mut retry: Reconnect,
    ) -> Result<(), TransportError> {
        loop {
            match connector.connect().await {
                Ok(transport) => {
                    retry.succeeded();
                    log::info!("Serving session via {}", connector.describe());
                    let summary = self.serve_session(transport).await;
                    log::info!(
                        "Session ended: {} calls, {} subscriptions{}",
                        summary.calls,
                        summary.subscriptions,
                        summary
                            .error
                            .as_deref()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                }
                Err(e) => retry.failed(e, &connector.describe()).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Empty, Envelope, TxId, VolumeMsg};
    use crate::transport::{Backoff, MemoryTransport, memory_connector, memory_pair};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Peer(MemoryTransport);

    impl Peer {
        async fn send(&mut self, envelope: Envelope) {
            self.0.send(envelope.encode().unwrap()).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.0.next())
                .await
                .expect("timed out waiting for envelope")
                .unwrap()
                .unwrap();
            Envelope::decode(&frame).unwrap()
        }

        /// Assert nothing arrives within a short window
        async fn assert_quiet(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(50), self.0.next()).await;
            assert!(next.is_err(), "unexpected envelope: {:?}", next);
        }
    }

    fn call(tx: &str, method: &str, message: serde_json::Value) -> Envelope {
        Envelope::call(TxId::from(tx), method, message)
    }

    /// Dispatcher with a unary `SetVolume` and a `Volume` stream fed by the
    /// returned sender
    fn volume_dispatcher(policy: UnknownMethodPolicy) -> (Dispatcher, mpsc::UnboundedSender<u32>) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel::<u32>();
        let feed = Arc::new(tokio::sync::Mutex::new(Some(feed_rx)));

        let mut dispatcher = Dispatcher::new("/YtMusic/").with_unknown_methods(policy);
        dispatcher.register_unary("SetVolume", |req: VolumeMsg| async move {
            if req.volume > 100 {
                return Err(HandlerError::failed("volume out of range"));
            }
            Ok(req)
        });
        dispatcher.register_stream("Volume", move |_: Empty| {
            let feed = Arc::clone(&feed);
            futures::stream::once(async move { feed.lock().await.take() })
                .filter_map(|rx| async move { rx })
                .flat_map(|rx| {
                    futures::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|volume| (Ok(VolumeMsg { volume }), rx))
                    })
                })
        });
        (dispatcher, feed_tx)
    }

    fn start(dispatcher: Dispatcher) -> (Peer, tokio::task::JoinHandle<SessionSummary>) {
        let (local, remote) = memory_pair();
        let session = tokio::spawn(async move { dispatcher.serve_session(local).await });
        (Peer(remote), session)
    }

    #[test]
    fn test_resolve_strips_prefix() {
        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Ignore);
        assert!(matches!(dispatcher.resolve("/YtMusic/SetVolume"), Ok(Some(_))));
        assert!(matches!(dispatcher.resolve("SetVolume"), Ok(Some(_))));
        assert!(matches!(dispatcher.resolve("/Other/SetVolume"), Ok(None)));
        assert_eq!(dispatcher.resolve("/YtMusic/Nope").err(), Some("Nope"));
        assert_eq!(dispatcher.methods(), vec!["SetVolume", "Volume"]);
    }

    #[tokio::test]
    async fn test_unary_reply_and_failure() {
        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Ignore);
        let (mut peer, _session) = start(dispatcher);

        peer.send(call("A", "/YtMusic/SetVolume", json!({"volume": 42}))).await;
        assert_eq!(
            peer.recv().await,
            Envelope::reply(TxId::from("A"), json!({"volume": 42}))
        );

        peer.send(call("B", "/YtMusic/SetVolume", json!({"volume": 420}))).await;
        assert_eq!(
            peer.recv().await,
            Envelope::failure(TxId::from("B"), "volume out of range")
        );
    }

    #[tokio::test]
    async fn test_stream_until_unsubscribe() {
        let (dispatcher, feed) = volume_dispatcher(UnknownMethodPolicy::Ignore);
        let (mut peer, _session) = start(dispatcher);

        peer.send(call("S", "/YtMusic/Volume", json!({}))).await;
        feed.send(10).unwrap();
        assert_eq!(peer.recv().await, Envelope::reply(TxId::from("S"), json!({"volume": 10})));
        feed.send(20).unwrap();
        assert_eq!(peer.recv().await, Envelope::reply(TxId::from("S"), json!({"volume": 20})));

        peer.send(Envelope::unsubscribe(TxId::from("S"))).await;
        // Unknown ids are a no-op
        peer.send(Envelope::unsubscribe(TxId::from("missing"))).await;

        // Round-trip a unary call so the unsubscribe is known to be processed
        peer.send(call("P", "SetVolume", json!({"volume": 1}))).await;
        assert_eq!(peer.recv().await.tx_id, TxId::from("P"));

        let _ = feed.send(30);
        peer.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_unknown_method_policies() {
        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Ignore);
        let (mut peer, _session) = start(dispatcher);
        peer.send(call("U", "/YtMusic/DoDance", json!({}))).await;
        peer.send(call("O", "/Other/SetVolume", json!({"volume": 1}))).await;
        peer.assert_quiet().await;

        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Reject);
        let (mut peer, _session) = start(dispatcher);
        peer.send(call("U", "/YtMusic/DoDance", json!({}))).await;
        let reply = peer.recv().await;
        assert_eq!(reply.tx_id, TxId::from("U"));
        assert!(reply.error.unwrap().contains("DoDance"));
    }

    #[tokio::test]
    async fn test_malformed_input_is_dropped() {
        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Reject);
        let (mut peer, session) = start(dispatcher);

        peer.0.send(Bytes::from_static(b"{broken")).await.unwrap();
        peer.send(call("M", "/YtMusic/SetVolume", json!({"volume": "loud"}))).await;
        peer.assert_quiet().await;

        peer.send(call("OK", "/YtMusic/SetVolume", json!({"volume": 3}))).await;
        assert_eq!(peer.recv().await.tx_id, TxId::from("OK"));

        drop(peer);
        let summary = session.await.unwrap();
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.calls, 1);
    }

    #[tokio::test]
    async fn test_serve_accepts_next_session_after_peer_drops() {
        let (dispatcher, _feed) = volume_dispatcher(UnknownMethodPolicy::Ignore);
        let (connector, dialer) = memory_connector();
        let retry = Reconnect::new(Backoff::new(Duration::from_millis(1)));
        let server = tokio::spawn(async move { dispatcher.serve(connector, retry).await });

        let mut first = Peer(dialer.dial().unwrap());
        first.send(call("A", "SetVolume", json!({"volume": 1}))).await;
        assert_eq!(first.recv().await, Envelope::reply(TxId::from("A"), json!({"volume": 1})));
        drop(first);

        let mut second = Peer(dialer.dial().unwrap());
        second.send(call("B", "SetVolume", json!({"volume": 2}))).await;
        assert_eq!(second.recv().await, Envelope::reply(TxId::from("B"), json!({"volume": 2})));

        server.abort();
    }

    #[tokio::test]
    async fn test_session_end_cancels_subscriptions() {
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();
        let dropped_tx = Arc::new(std::sync::Mutex::new(Some(dropped_tx)));

        struct Guard(Option<tokio::sync::oneshot::Sender<()>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let mut dispatcher = Dispatcher::new("/YtMusic/");
        dispatcher.register_stream("PlayerState", move |_: Empty| {
            let guard = Guard(dropped_tx.lock().unwrap().take());
            futures::stream::pending::<Result<Empty, HandlerError>>().map(move |item| {
                let _held = &guard;
                item
            })
        });

        let (mut peer, session) = start(dispatcher);
        peer.send(call("S", "/YtMusic/PlayerState", json!({}))).await;
        peer.assert_quiet().await;
        drop(peer);

        let summary = session.await.unwrap();
        assert_eq!(summary.subscriptions, 1);
        tokio::time::timeout(Duration::from_secs(5), dropped_rx)
            .await
            .unwrap()
            .unwrap();
    }
}
