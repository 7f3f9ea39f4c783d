//! Stdio/socket bridge for playback control
//!
//! Layers, bottom up:
//! - `relay`: copies bytes (or whole frames) between stdio and a socket that
//!   may come and go
//! - `transport`: length-prefixed framing, socket connectors and reconnect
//!   backoff
//! - `client` / `server`: transaction-correlated calls and subscriptions over
//!   one message transport
//! - `service`: the playback contract and an in-memory player

pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod service;
pub mod transport;
