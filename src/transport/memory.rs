//! In-process message transport
//!
//! Channels already keep message boundaries, so frames pass through without the
//! length-prefix codec. Used to wire a client and a dispatcher inside one
//! process and as the transport in tests.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::TransportError;
use super::socket::TransportConnector;

/// One end of an in-memory transport pair
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// Create two connected transport ends
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();
    (
        MemoryTransport {
            inbound: a_rx,
            outbound: b_tx,
        },
        MemoryTransport {
            inbound: b_rx,
            outbound: a_tx,
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "memory transport peer is gone")
}

impl Stream for MemoryTransport {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_next_unpin(cx).map(|frame| frame.map(Ok))
    }
}

impl Sink<Bytes> for MemoryTransport {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.outbound.is_closed() {
            Poll::Ready(Err(broken_pipe()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        self.outbound.unbounded_send(item).map_err(|_| broken_pipe())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outbound.close_channel();
        Poll::Ready(Ok(()))
    }
}

/// Accepting side of an in-memory "socket": yields one transport per dial
#[derive(Debug)]
pub struct MemoryConnector {
    sessions: mpsc::UnboundedReceiver<MemoryTransport>,
}

/// Dialing side paired with a [`MemoryConnector`]
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    sessions: mpsc::UnboundedSender<MemoryTransport>,
}

/// Create a connector and the dialer that feeds it
pub fn memory_connector() -> (MemoryConnector, MemoryDialer) {
    let (tx, rx) = mpsc::unbounded();
    (MemoryConnector { sessions: rx }, MemoryDialer { sessions: tx })
}

impl MemoryDialer {
    /// Open a new session; the other end is handed to the connector
    pub fn dial(&self) -> Result<MemoryTransport, TransportError> {
        let (local, remote) = memory_pair();
        self.sessions
            .unbounded_send(remote)
            .map_err(|_| TransportError::Connection("memory connector is gone".to_string()))?;
        Ok(local)
    }
}

impl TransportConnector for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(&mut self) -> Result<MemoryTransport, TransportError> {
        self.sessions
            .next()
            .await
            .ok_or_else(|| TransportError::Connection("memory dialer is gone".to_string()))
    }

    fn describe(&self) -> String {
        "in-memory transport".to_string()
    }
}
