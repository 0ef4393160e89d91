//! In-memory connection for unit tests.

use tokio::sync::mpsc;
use typeroom_protocol::ConnectionId;
use typeroom_transport::{CloseCode, Connection, TransportError};

/// A connection whose outbound queue is a bounded channel the test reads
/// from. It never receives anything.
pub(crate) struct FakeConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl FakeConnection {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let conn = Self {
            id: ConnectionId::new(),
            outbound,
        };
        (conn, rx)
    }
}

impl Connection for FakeConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.outbound
            .send(data.to_vec())
            .await
            .map_err(|_| TransportError::ConnectionClosed("receiver dropped".into()))
    }

    fn try_send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.outbound.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::ConnectionClosed("receiver dropped".into())
            }
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        std::future::pending().await
    }

    async fn close_with(&self, _code: CloseCode, _reason: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
