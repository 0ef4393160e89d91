//! Transport abstraction layer for Typeroom.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the network protocol carrying client frames.
//!
//! Outbound data goes through a bounded per-connection queue. A caller
//! that cannot afford to wait uses [`Connection::try_send`], which fails
//! with [`TransportError::BufferFull`] instead of blocking when the peer
//! is not draining its socket fast enough.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why the server is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Orderly shutdown, e.g. the client detached or the room ended.
    Normal,
    /// The server is going away.
    Away,
    /// The peer broke the rules: bad handshake or too slow to keep up.
    PolicyViolation,
    /// An unexpected server-side failure.
    Error,
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    /// Gracefully shuts down the transport, stopping new connections.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A single connection that can send and receive bytes.
///
/// Methods take `&self` so the connection can be shared (behind an `Arc`)
/// between the task reading client frames and the task delivering stream
/// entries.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Queues data for the remote peer, waiting for queue space.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Queues data for the remote peer without waiting.
    ///
    /// Fails instead of blocking when the outbound queue is full.
    fn try_send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Closes the connection with a code and a human-readable reason.
    ///
    /// The close frame skips the outbound queue so a slow consumer can
    /// still be told why it is being dropped. Closing twice is a no-op.
    fn close_with(
        &self,
        code: CloseCode,
        reason: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Closes the connection normally.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.close_with(CloseCode::Normal, "")
    }

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
