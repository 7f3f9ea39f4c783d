//! One dispatcher session
//!
//! The dispatch loop owns the subscription table. Handler tasks never touch it;
//! they report replies, stream items and stream completion back through one
//! channel, which also keeps per-id ordering intact.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handler::{Handler, HandlerError, ItemStream, UnaryFuture};
use super::{Dispatcher, UnknownMethodPolicy};
use crate::protocol::{Envelope, TxId};
use crate::transport::MessageTransport;

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Unary calls dispatched to a handler
    pub calls: u64,
    /// Subscriptions opened
    pub subscriptions: u64,
    /// Frames dropped as malformed
    pub dropped: u64,
    /// Transport failure that ended the session, if any
    pub error: Option<String>,
}

enum Outbound {
    /// Unary reply, always written
    Reply(Envelope),
    /// Stream item, written only while the subscription is live
    Item(Envelope),
    /// The stream task for this id has stopped
    Finished(TxId),
}

struct Session<'a> {
    dispatcher: &'a Dispatcher,
    subscriptions: HashMap<TxId, CancellationToken>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    summary: SessionSummary,
}

pub(super) async fn run<T: MessageTransport>(dispatcher: &Dispatcher, transport: T) -> SessionSummary {
    let (outbound, mut queue) = mpsc::unbounded_channel();
    let mut session = Session {
        dispatcher,
        subscriptions: HashMap::new(),
        outbound,
        cancel: CancellationToken::new(),
        summary: SessionSummary::default(),
    };
    let (mut sink, mut stream) = transport.split();

    loop {
        tokio::select! {
            biased;
            Some(outbound) = queue.recv() => {
                let Some(envelope) = session.deliverable(outbound) else {
                    continue;
                };
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to encode reply for {}: {}", envelope.tx_id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    session.summary.error = Some(e.to_string());
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => session.handle_frame(&frame),
                Some(Err(e)) => {
                    session.summary.error = Some(e.to_string());
                    break;
                }
                None => break,
            },
        }
    }

    // Child tokens of the session token cover every subscription
    session.cancel.cancel();
    if !session.subscriptions.is_empty() {
        log::debug!("Cancelled {} subscriptions at session end", session.subscriptions.len());
    }
    session.summary
}

impl Session<'_> {
    /// Apply bookkeeping for a task report; returns the envelope to write
    fn deliverable(&mut self, outbound: Outbound) -> Option<Envelope> {
        match outbound {
            Outbound::Reply(envelope) => Some(envelope),
            Outbound::Item(envelope) => {
                if self.subscriptions.contains_key(&envelope.tx_id) {
                    Some(envelope)
                } else {
                    log::trace!("Dropping item for closed subscription {}", envelope.tx_id);
                    None
                }
            }
            Outbound::Finished(tx_id) => {
                if self.subscriptions.remove(&tx_id).is_some() {
                    log::debug!("Subscription {} finished", tx_id);
                }
                None
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Dropping malformed envelope: {}", e);
                self.summary.dropped += 1;
                return;
            }
        };

        match envelope.method {
            Some(method) => self.handle_call(envelope.tx_id, &method, envelope.message),
            None if envelope.message.is_none() && envelope.error.is_none() => {
                self.unsubscribe(&envelope.tx_id)
            }
            None => log::debug!("Ignoring reply-shaped envelope {} on the server side", envelope.tx_id),
        }
    }

    fn handle_call(&mut self, tx_id: TxId, method: &str, message: Option<Value>) {
        let dispatcher = self.dispatcher;
        let handler = match dispatcher.resolve(method) {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                log::debug!("Ignoring {} for another service", method);
                return;
            }
            Err(name) => {
                log::warn!("No handler for method {}", name);
                if dispatcher.unknown_methods == UnknownMethodPolicy::Reject {
                    let reply = Envelope::failure(tx_id, format!("Unknown method: {}", name));
                    let _ = self.outbound.send(Outbound::Reply(reply));
                }
                return;
            }
        };

        let message = message.unwrap_or_else(|| Value::Object(Default::default()));
        let started = match handler {
            Handler::Unary(call) => call(message).map(|reply| self.spawn_unary(tx_id.clone(), reply)),
            Handler::Stream(open) => open(message).map(|items| self.spawn_stream(tx_id.clone(), items)),
        };

        match started {
            Ok(()) => {}
            Err(HandlerError::InvalidRequest(e)) => {
                log::debug!("Dropping {} ({}): {}", method, tx_id, e);
                self.summary.dropped += 1;
            }
            Err(e) => {
                let _ = self.outbound.send(Outbound::Reply(Envelope::failure(tx_id, e.to_string())));
            }
        }
    }

    fn spawn_unary(&mut self, tx_id: TxId, reply: UnaryFuture) {
        self.summary.calls += 1;
        let outbound = self.outbound.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = reply => result,
            };
            let envelope = match result {
                Ok(message) => Envelope::reply(tx_id, message),
                Err(e) => Envelope::failure(tx_id, e.to_string()),
            };
            // The session may have ended meanwhile
            let _ = outbound.send(Outbound::Reply(envelope));
        });
    }

    fn spawn_stream(&mut self, tx_id: TxId, mut items: ItemStream) {
        if self.subscriptions.contains_key(&tx_id) {
            log::warn!("Subscription {} already active, ignoring duplicate", tx_id);
            return;
        }

        self.summary.subscriptions += 1;
        let cancel = self.cancel.child_token();
        self.subscriptions.insert(tx_id.clone(), cancel.clone());
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = items.next() => item,
                };

                let envelope = match item {
                    Some(Ok(message)) => Envelope::reply(tx_id.clone(), message),
                    Some(Err(e)) => {
                        let _ = outbound.send(Outbound::Item(Envelope::failure(tx_id.clone(), e.to_string())));
                        break;
                    }
                    None => break,
                };
                if outbound.send(Outbound::Item(envelope)).is_err() {
                    break;
                }
            }
            let _ = outbound.send(Outbound::Finished(tx_id));
        });
    }

    fn unsubscribe(&mut self, tx_id: &TxId) {
        match self.subscriptions.remove(tx_id) {
            Some(cancel) => {
                cancel.cancel();
                log::debug!("Unsubscribed {}", tx_id);
            }
            None => log::debug!("Unsubscribe for unknown id {}", tx_id),
        }
    }
}
