//! Feed stream client
//!
//! Keeps one WebSocket connection to the feed alive: heartbeats, fixed-delay
//! reconnection and subscription replay. The network sits behind the
//! [`Transport`] trait so the client can be driven by a scripted peer.

mod client;
mod transport;
mod types;

pub use client::StreamClient;
pub use transport::{Connection, Transport, TungsteniteTransport};
pub use types::{ConnectionState, Frame, WsConfig, WsError, HEARTBEAT_REPLY, HEARTBEAT_TEXT};

/// Receives every binary frame from the stream
///
/// Called on the connection task; implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, data: &[u8]);
}
