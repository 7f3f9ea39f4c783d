//! Transport layer for the bridge
//!
//! This module turns byte streams into message transports and hands out fresh
//! socket sessions on demand.
//!
//! The transport layer is organized into:
//! - `codec`: length-prefixed framing for byte streams
//! - `memory`: in-process transport that keeps message boundaries natively
//! - `socket`: connectors producing socket sessions, plus reconnect backoff
//! - `stdio`: joins stdin and stdout into one duplex stream

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use thiserror::Error;

mod codec;
mod memory;
mod socket;
mod stdio;

pub use codec::{FrameCodec, LENGTH_PREFIX_LEN};
pub use memory::{MemoryConnector, MemoryDialer, MemoryTransport, memory_connector, memory_pair};
pub use socket::{
    Backoff, Connector, Framing, Reconnect, TcpDialer, TransportConnector, UnixAcceptor,
    UnixDialer,
};
pub use stdio::StdioStream;

/// A bidirectional transport that delivers whole messages.
///
/// Byte streams become message transports through [`FrameCodec`]
/// (`Framed<S, FrameCodec>`); [`MemoryTransport`] is one natively.
pub trait MessageTransport:
    Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Unpin + Send
{
}

impl<T> MessageTransport for T where
    T: Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Unpin + Send
{
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket connection error: {0}")]
    Connection(String),
    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Gave up reaching {target} after {attempts} attempts: {last}")]
    GaveUp {
        target: String,
        attempts: u32,
        last: String,
    },
}
