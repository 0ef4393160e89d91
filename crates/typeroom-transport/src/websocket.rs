//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Each accepted socket is split in two. The read half stays with the
//! connection behind a lock and is only ever polled by the task reading
//! client frames. The write half is owned by a spawned writer task that
//! drains a bounded queue, so a peer that stops reading fills the queue
//! instead of stalling whoever is publishing to it.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;

use crate::{CloseCode, Connection, ConnectionId, Transport, TransportError};

type WsStream = WebSocketStream<TcpStream>;

const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `close` waits for the writer to flush the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
    queue_capacity: usize,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self {
            listener,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Sets the per-connection outbound queue capacity (minimum 1).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets how long a client may take to complete the WebSocket upgrade.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::accept_async(stream),
        )
        .await
        .map_err(|_| {
            TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "websocket upgrade timed out",
            ))
        })?
        .map_err(|e| {
            TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                e,
            ))
        })?;

        let id = ConnectionId::new();
        tracing::debug!(%id, %addr, "accepted WebSocket connection");

        Ok(WebSocketConnection::spawn(id, addr, ws, self.queue_capacity))
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        tracing::info!("WebSocket transport shutting down");
        Ok(())
    }
}

/// A single WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<SplitStream<WsStream>>,
    /// Taken by the first close; `None` afterwards.
    closer: Mutex<Option<(oneshot::Sender<CloseFrame>, JoinHandle<()>)>>,
}

impl WebSocketConnection {
    fn spawn(
        id: ConnectionId,
        peer: SocketAddr,
        ws: WsStream,
        capacity: usize,
    ) -> Self {
        let (sink, stream) = ws.split();
        let (outbound, queue) = mpsc::channel(capacity);
        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(id, sink, queue, close_rx));

        Self {
            id,
            peer,
            outbound,
            inbound: Mutex::new(stream),
            closer: Mutex::new(Some((close_tx, writer))),
        }
    }

    /// Returns the remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Text frames for UTF-8 payloads (what browsers expect for JSON),
/// binary otherwise.
fn to_message(data: &[u8]) -> Message {
    match std::str::from_utf8(data) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => Message::Binary(data.to_vec().into()),
    }
}

fn to_ws_code(code: CloseCode) -> WsCloseCode {
    match code {
        CloseCode::Normal => WsCloseCode::Normal,
        CloseCode::Away => WsCloseCode::Away,
        CloseCode::PolicyViolation => WsCloseCode::Policy,
        CloseCode::Error => WsCloseCode::Error,
    }
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::Receiver<Message>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
) {
    loop {
        tokio::select! {
            biased;

            frame = &mut close_rx => {
                // Err means the connection was dropped without an
                // explicit close.
                let _ = sink.send(Message::Close(frame.ok())).await;
                break;
            }
            msg = queue.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(%id, error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }
    tracing::debug!(%id, "WebSocket writer stopped");
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.outbound
            .send(to_message(data))
            .await
            .map_err(|_| TransportError::ConnectionClosed("writer stopped".into()))
    }

    fn try_send(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.outbound
            .try_send(to_message(data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
                mpsc::error::TrySendError::Closed(_) => {
                    TransportError::ConnectionClosed("writer stopped".into())
                }
            })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut inbound = self.inbound.lock().await;
        loop {
            match inbound.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }

    async fn close_with(
        &self,
        code: CloseCode,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let Some((close_tx, writer)) = self.closer.lock().await.take() else {
            return Ok(());
        };

        let frame = CloseFrame {
            code: to_ws_code(code),
            reason: reason.to_owned().into(),
        };
        // The writer may already have stopped on a write error.
        let _ = close_tx.send(frame);

        let abort = writer.abort_handle();
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
            tracing::debug!(id = %self.id, "close frame not flushed in time");
            abort.abort();
        }
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
