//! Per-connection handler: attach, then fan room traffic out.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive `attach` → authenticate → check room membership
//!   2. Register the connection in presence and the local registry
//!   3. Send `attached` and the room's initial state
//!   4. Spawn delivery: room stream entries → socket
//!   5. Loop: receive client frames (cursor, ping) until the client
//!      leaves, goes idle, falls behind or the room closes
//!
//! Detaching always runs through [`DetachGuard`], however the handler
//! exits.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use typeroom_game::Repository;
use typeroom_presence::PresenceError;
use typeroom_protocol::{
    ClientFrame, Codec, ConnectionId, Cursor, CursorUpdate, EntryId, InitialState, JsonCodec,
    PushMessage, RoomId, ServerFrame, UserId,
};
use typeroom_stream::{StreamStore, Subscription};
use typeroom_transport::{CloseCode, Connection, TransportError, WebSocketConnection};

use crate::registry::Peer;
use crate::server::ServerState;
use crate::{Authenticator, TyperoomError};

const SLOW_CONSUMER_REASON: &str = "connection too slow to keep up with messages";

struct Attachment {
    user_id: UserId,
    room_id: RoomId,
    last_seen: Option<EntryId>,
}

/// Why delivery of a room's stream to a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryEnd {
    /// The stream was terminated or deleted.
    RoomClosed,
    /// The connection's outbound queue filled up.
    SlowConsumer,
    /// The connection is already gone.
    Disconnected,
    StreamFailed,
}

impl DeliveryEnd {
    fn close_reason(self) -> (CloseCode, &'static str) {
        match self {
            Self::RoomClosed => (CloseCode::Normal, "room closed"),
            Self::SlowConsumer => (CloseCode::PolicyViolation, SLOW_CONSUMER_REASON),
            Self::Disconnected => (CloseCode::Normal, ""),
            Self::StreamFailed => (CloseCode::Error, "room stream failed"),
        }
    }
}

enum Flow {
    Continue,
    Close(CloseCode, &'static str),
}

/// Drop guard that detaches a connection when the handler exits.
///
/// `Drop` is synchronous, so the async cleanup runs in a spawned task.
struct DetachGuard<S: StreamStore, R: Repository, A: Authenticator> {
    room_id: RoomId,
    user_id: UserId,
    conn_id: ConnectionId,
    state: Arc<ServerState<S, R, A>>,
}

impl<S: StreamStore, R: Repository, A: Authenticator> Drop for DetachGuard<S, R, A> {
    fn drop(&mut self) {
        let (room_id, user_id, conn_id) = (self.room_id, self.user_id, self.conn_id);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            detach(&state, room_id, user_id, conn_id).await;
        });
    }
}

async fn detach<S, R, A>(
    state: &ServerState<S, R, A>,
    room_id: RoomId,
    user_id: UserId,
    conn_id: ConnectionId,
) where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    state.registry.leave(room_id, conn_id).await;
    match state.presence.remove_connection(room_id, user_id, conn_id).await {
        Ok(true) => {
            tracing::info!(%room_id, %user_id, "user left");
            if let Err(e) = state
                .stream
                .publish_push_message(room_id, &PushMessage::UserLeft(user_id))
                .await
            {
                tracing::warn!(%room_id, %user_id, error = %e, "failed to announce user_left");
            }
        }
        Ok(false) => {}
        // The room or the membership is already gone.
        Err(e) => tracing::debug!(%room_id, %user_id, error = %e, "detach skipped presence"),
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<S, R, A>(
    conn: WebSocketConnection,
    state: Arc<ServerState<S, R, A>>,
) -> Result<(), TyperoomError>
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, peer = %conn.peer_addr(), "handling new connection");

    // --- Step 1: Attach ---
    let Attachment {
        user_id,
        room_id,
        last_seen,
    } = match perform_handshake(&conn, &state).await {
        Ok(attachment) => attachment,
        Err(e) => {
            if !matches!(e, TyperoomError::Transport(_)) {
                let _ = send_error(&*conn, &state.codec, e.code(), &e.to_string()).await;
                let _ = conn.close_with(CloseCode::PolicyViolation, "attach failed").await;
            }
            return Err(e);
        }
    };
    tracing::info!(%conn_id, %user_id, %room_id, "connection attached");

    // --- Step 2: Register ---
    let joined = state.presence.add_connection(room_id, user_id, conn_id).await?;
    let _guard = DetachGuard {
        room_id,
        user_id,
        conn_id,
        state: Arc::clone(&state),
    };
    let kick = CancellationToken::new();
    state
        .registry
        .join(
            room_id,
            Peer {
                user_id,
                conn: Arc::clone(&conn),
                kick: kick.clone(),
            },
        )
        .await;
    if joined {
        tracing::info!(%room_id, %user_id, "user joined");
        state
            .stream
            .publish_push_message(room_id, &PushMessage::UserJoined(user_id))
            .await?;
    }

    // --- Step 3: Initial state ---
    send_frame(
        &*conn,
        &state.codec,
        &ServerFrame::Attached {
            user_id,
            connection_id: conn_id,
        },
    )
    .await?;

    // Pin the stream position before the snapshot so nothing published
    // while it is built is missed.
    let cursor = match last_seen {
        Some(id) => Cursor::After(id),
        None => Cursor::After(state.stream.last_id(room_id).await?),
    };
    let initial = initial_state(&state, room_id).await?;
    send_frame(
        &*conn,
        &state.codec,
        &ServerFrame::local(PushMessage::InitialState(Box::new(initial))),
    )
    .await?;

    // --- Step 4: Delivery ---
    let mut subscription = state.stream.subscribe_push_messages(room_id, cursor).await?;
    let mut delivery = {
        let conn = Arc::clone(&conn);
        let kick = kick.clone();
        let codec = state.codec;
        tokio::spawn(async move { deliver(&*conn, &codec, &mut subscription, &kick).await })
    };

    // --- Step 5: Inbound loop ---
    let config = &state.config;
    let mut throttle = CursorThrottle::new(config.cursor_throttle);
    let mut idle_deadline = Instant::now() + config.idle_timeout;
    let mut keepalive = Instant::now() + jittered(config.keepalive_interval);

    let (code, reason) = loop {
        let flow = tokio::select! {
            ended = &mut delivery => match ended {
                Ok(end) => {
                    tracing::debug!(%conn_id, %user_id, ?end, "delivery ended");
                    if end == DeliveryEnd::SlowConsumer {
                        tracing::warn!(%room_id, %user_id, %conn_id, "{SLOW_CONSUMER_REASON}");
                    }
                    let (code, reason) = end.close_reason();
                    Flow::Close(code, reason)
                }
                Err(e) => {
                    tracing::error!(%conn_id, error = %e, "delivery task failed");
                    Flow::Close(CloseCode::Error, "delivery failed")
                }
            },

            received = conn.recv() => match received {
                Ok(Some(data)) => {
                    idle_deadline = Instant::now() + config.idle_timeout;
                    handle_frame(&*conn, &state, room_id, user_id, &data, &mut throttle).await
                }
                Ok(None) => {
                    tracing::info!(%conn_id, %user_id, "connection closed cleanly");
                    Flow::Close(CloseCode::Normal, "")
                }
                Err(e) => {
                    tracing::debug!(%conn_id, %user_id, error = %e, "recv error");
                    Flow::Close(CloseCode::Error, "receive failed")
                }
            },

            _ = sleep_until(idle_deadline) => {
                tracing::info!(%conn_id, %user_id, "connection idle, closing");
                Flow::Close(CloseCode::Normal, "idle timeout")
            }

            _ = sleep_until(keepalive) => {
                keepalive = Instant::now() + jittered(config.keepalive_interval);
                refresh_presence(&state, room_id, user_id, conn_id).await
            }

            _ = sleep_until(throttle.deadline().unwrap_or_else(Instant::now)),
                if throttle.deadline().is_some() =>
            {
                match throttle.fire(Instant::now()) {
                    Some(position) => fan_out_cursor(&state, room_id, user_id, conn_id, position).await,
                    None => Flow::Continue,
                }
            }
        };

        if let Flow::Close(code, reason) = flow {
            break (code, reason);
        }
    };

    delivery.abort();
    kick.cancel();
    if let Err(e) = conn.close_with(code, reason).await {
        tracing::debug!(%conn_id, error = %e, "close failed");
    }
    tracing::debug!(%conn_id, %user_id, ?code, reason, "connection finished");

    // _guard drops here → detach fires.
    Ok(())
}

/// Receives `attach`, authenticates it, and checks the user belongs to
/// the room.
async fn perform_handshake<S, R, A>(
    conn: &WebSocketConnection,
    state: &ServerState<S, R, A>,
) -> Result<Attachment, TyperoomError>
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    let data = match tokio::time::timeout(state.config.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(TyperoomError::Handshake("connection closed before attach".into()));
        }
        Ok(Err(e)) => return Err(TyperoomError::Transport(e)),
        Err(_) => return Err(TyperoomError::Handshake("attach timed out".into())),
    };

    let frame: ClientFrame = state
        .codec
        .decode(&data)
        .map_err(|e| TyperoomError::Handshake(format!("invalid attach frame: {e}")))?;
    let ClientFrame::Attach {
        token,
        room_id,
        last_seen,
    } = frame
    else {
        return Err(TyperoomError::Handshake("first frame must be attach".into()));
    };

    let user_id = state.auth.authenticate(&token).await?;
    state.rooms.ensure_room(room_id).await?;
    if !state.presence.is_subscriber(room_id, user_id).await {
        return Err(TyperoomError::NotSubscriber {
            room: room_id,
            user: user_id,
        });
    }

    Ok(Attachment {
        user_id,
        room_id,
        last_seen,
    })
}

/// Builds the snapshot sent right after `attached`.
///
/// Reading the subscribers heals stale presence; anyone found to have
/// gone inactive is announced to the room.
async fn initial_state<S, R, A>(
    state: &ServerState<S, R, A>,
    room_id: RoomId,
) -> Result<InitialState, TyperoomError>
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    let room = state.presence.room(room_id).await?;
    let snapshot = state.presence.get_all_subscribers(room_id).await?;
    for user_id in snapshot.went_inactive {
        tracing::info!(%room_id, %user_id, "stale user left");
        state
            .stream
            .publish_push_message(room_id, &PushMessage::UserLeft(user_id))
            .await?;
    }

    Ok(InitialState {
        room,
        subscribers: snapshot.subscribers,
        game: state.games.current_game(room_id).await,
        scores: state.games.current_game_scores(room_id).await?,
    })
}

async fn handle_frame<S, R, A>(
    conn: &WebSocketConnection,
    state: &ServerState<S, R, A>,
    room_id: RoomId,
    user_id: UserId,
    data: &[u8],
    throttle: &mut CursorThrottle,
) -> Flow
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    let frame: ClientFrame = match state.codec.decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(%user_id, error = %e, "failed to decode frame");
            return push_error(conn, &state.codec, 400, &format!("invalid frame: {e}"));
        }
    };

    match frame {
        ClientFrame::Cursor { position } => match throttle.offer(position, Instant::now()) {
            Some(position) => fan_out_cursor(state, room_id, user_id, conn.id(), position).await,
            None => Flow::Continue,
        },
        ClientFrame::Ping => {
            if let Flow::Close(code, reason) = push_frame(conn, &state.codec, &ServerFrame::Pong) {
                return Flow::Close(code, reason);
            }
            refresh_presence(state, room_id, user_id, conn.id()).await
        }
        ClientFrame::Attach { .. } => push_error(conn, &state.codec, 409, "already attached"),
    }
}

/// Extends the connection's presence expiry.
///
/// A refresh that finds the subscriber gone (they left the room, or the
/// room was deleted) ends the connection.
async fn refresh_presence<S, R, A>(
    state: &ServerState<S, R, A>,
    room_id: RoomId,
    user_id: UserId,
    conn_id: ConnectionId,
) -> Flow
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    match state.presence.add_connection(room_id, user_id, conn_id).await {
        Ok(true) => {
            // The connection had expired; the user is back.
            if let Err(e) = state
                .stream
                .publish_push_message(room_id, &PushMessage::UserJoined(user_id))
                .await
            {
                tracing::warn!(%room_id, %user_id, error = %e, "failed to announce user_joined");
            }
            Flow::Continue
        }
        Ok(false) => Flow::Continue,
        Err(PresenceError::RoomNotFound(_) | PresenceError::SubscriberNotFound { .. }) => {
            Flow::Close(CloseCode::Normal, "no longer a member of the room")
        }
        Err(e) => {
            tracing::warn!(%room_id, %user_id, error = %e, "presence refresh failed");
            Flow::Continue
        }
    }
}

async fn fan_out_cursor<S, R, A>(
    state: &ServerState<S, R, A>,
    room_id: RoomId,
    user_id: UserId,
    conn_id: ConnectionId,
    position: u32,
) -> Flow
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    let frame = ServerFrame::local(PushMessage::Cursor(CursorUpdate { user_id, position }));
    match state.codec.encode(&frame) {
        Ok(bytes) => {
            state.registry.broadcast(room_id, conn_id, &bytes).await;
        }
        Err(e) => tracing::error!(%room_id, error = %e, "failed to encode cursor update"),
    }
    Flow::Continue
}

/// Forwards stream entries to the connection until something stops it.
///
/// Never waits on the socket: a full outbound queue ends delivery as a
/// slow consumer.
pub(crate) async fn deliver<C>(
    conn: &C,
    codec: &JsonCodec,
    subscription: &mut Subscription<PushMessage>,
    kick: &CancellationToken,
) -> DeliveryEnd
where
    C: Connection<Error = TransportError>,
{
    loop {
        let next = tokio::select! {
            _ = kick.cancelled() => return DeliveryEnd::SlowConsumer,
            next = subscription.next() => next,
        };
        let delivered = match next {
            Some(Ok(delivered)) => delivered,
            Some(Err(e)) => {
                tracing::warn!(room_id = %subscription.room(), error = %e, "room stream failed");
                return DeliveryEnd::StreamFailed;
            }
            None => return DeliveryEnd::RoomClosed,
        };

        let kind = delivered.item.kind();
        let bytes = match codec.encode(&ServerFrame::entry(delivered.id, delivered.item)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(id = %delivered.id, kind, error = %e, "failed to encode push message");
                continue;
            }
        };
        match conn.try_send(&bytes) {
            Ok(()) => tracing::trace!(conn_id = %conn.id(), id = %delivered.id, kind, "delivered"),
            Err(TransportError::BufferFull) => {
                kick.cancel();
                return DeliveryEnd::SlowConsumer;
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "delivery stopped");
                return DeliveryEnd::Disconnected;
            }
        }
    }
}

/// Latest-wins rate limiter for one connection's cursor updates.
///
/// The first update after a quiet period goes out at once and opens a
/// window; updates inside the window collapse into the last one, which
/// goes out when the window closes.
#[derive(Debug)]
pub(crate) struct CursorThrottle {
    every: Duration,
    pending: Option<u32>,
    window_ends: Option<Instant>,
}

impl CursorThrottle {
    pub(crate) fn new(every: Duration) -> Self {
        Self {
            every,
            pending: None,
            window_ends: None,
        }
    }

    /// Records a position. Returns it if it should be sent now.
    pub(crate) fn offer(&mut self, position: u32, now: Instant) -> Option<u32> {
        match self.window_ends {
            Some(_) => {
                self.pending = Some(position);
                None
            }
            None => {
                self.window_ends = Some(now + self.every);
                Some(position)
            }
        }
    }

    /// When the open window ends, if one is open.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.window_ends
    }

    /// Closes the window. Returns the held position, if any, and opens a
    /// new window for it.
    pub(crate) fn fire(&mut self, now: Instant) -> Option<u32> {
        let pending = self.pending.take();
        self.window_ends = pending.map(|_| now + self.every);
        pending
    }
}

/// `base` plus up to a tenth of it, so connections opened together do
/// not refresh in lockstep.
fn jittered(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 10).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Sends a frame, waiting for queue space. Used before delivery starts.
async fn send_frame<C>(conn: &C, codec: &JsonCodec, frame: &ServerFrame) -> Result<(), TyperoomError>
where
    C: Connection<Error = TransportError>,
{
    let bytes = codec.encode(frame)?;
    conn.send(&bytes).await?;
    Ok(())
}

async fn send_error<C>(conn: &C, codec: &JsonCodec, code: u16, message: &str) -> Result<(), TyperoomError>
where
    C: Connection<Error = TransportError>,
{
    let frame = ServerFrame::Error {
        code,
        message: message.to_string(),
    };
    send_frame(conn, codec, &frame).await
}

/// Queues a frame without waiting. A full queue closes the connection.
fn push_frame<C>(conn: &C, codec: &JsonCodec, frame: &ServerFrame) -> Flow
where
    C: Connection<Error = TransportError>,
{
    let bytes = match codec.encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame");
            return Flow::Continue;
        }
    };
    match conn.try_send(&bytes) {
        Ok(()) => Flow::Continue,
        Err(TransportError::BufferFull) => Flow::Close(CloseCode::PolicyViolation, SLOW_CONSUMER_REASON),
        Err(_) => Flow::Close(CloseCode::Normal, ""),
    }
}

fn push_error<C>(conn: &C, codec: &JsonCodec, code: u16, message: &str) -> Flow
where
    C: Connection<Error = TransportError>,
{
    let frame = ServerFrame::Error {
        code,
        message: message.to_string(),
    };
    push_frame(conn, codec, &frame)
}

#[cfg(test)]
mod tests {
    use typeroom_stream::{MemoryStreamStore, StreamConfig, StreamTransport};
    use typeroom_protocol::StreamAction;

    use super::*;
    use crate::testing::FakeConnection;

    fn transport() -> StreamTransport<MemoryStreamStore> {
        StreamTransport::new(MemoryStreamStore::new(), StreamConfig::default())
    }

    fn decode(bytes: &[u8]) -> ServerFrame {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_deliver_forwards_entries_with_their_ids() {
        let stream = transport();
        let room = RoomId::new();
        let user = UserId::new();
        let mut subscription = stream
            .subscribe_push_messages(room, Cursor::Latest)
            .await
            .unwrap();
        let id = stream
            .publish_push_message(room, &PushMessage::UserJoined(user))
            .await
            .unwrap();
        stream.publish_action(room, StreamAction::Terminate).await.unwrap();

        let (conn, mut rx) = FakeConnection::new(8);
        let kick = CancellationToken::new();
        let end = deliver(&conn, &JsonCodec, &mut subscription, &kick).await;

        assert_eq!(end, DeliveryEnd::RoomClosed);
        assert_eq!(
            decode(&rx.recv().await.unwrap()),
            ServerFrame::entry(id, PushMessage::UserJoined(user))
        );
        assert!(rx.try_recv().is_err());
        assert!(!kick.is_cancelled());
    }

    #[tokio::test]
    async fn test_deliver_stops_slow_consumer() {
        let stream = transport();
        let room = RoomId::new();
        let mut subscription = stream
            .subscribe_push_messages(room, Cursor::Latest)
            .await
            .unwrap();
        for _ in 0..3 {
            stream
                .publish_push_message(room, &PushMessage::UserJoined(UserId::new()))
                .await
                .unwrap();
        }

        // Room for one frame, and nobody reads it.
        let (conn, _rx) = FakeConnection::new(1);
        let kick = CancellationToken::new();
        let end = deliver(&conn, &JsonCodec, &mut subscription, &kick).await;

        assert_eq!(end, DeliveryEnd::SlowConsumer);
        assert!(kick.is_cancelled());
        assert_eq!(end.close_reason().0, CloseCode::PolicyViolation);
    }

    #[tokio::test]
    async fn test_deliver_stops_when_kicked() {
        let stream = transport();
        let mut subscription = stream
            .subscribe_push_messages(RoomId::new(), Cursor::Latest)
            .await
            .unwrap();
        let (conn, _rx) = FakeConnection::new(8);
        let kick = CancellationToken::new();
        kick.cancel();

        let end = deliver(&conn, &JsonCodec, &mut subscription, &kick).await;
        assert_eq!(end, DeliveryEnd::SlowConsumer);
    }

    #[tokio::test]
    async fn test_deliver_ends_quietly_when_stream_deleted() {
        let stream = transport();
        let room = RoomId::new();
        let mut subscription = stream
            .subscribe_push_messages(room, Cursor::Latest)
            .await
            .unwrap();
        // Let the reader block on the live stream before it goes away.
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.delete(room).await.unwrap();

        let (conn, _rx) = FakeConnection::new(8);
        let end = deliver(&conn, &JsonCodec, &mut subscription, &CancellationToken::new()).await;
        assert_eq!(end, DeliveryEnd::RoomClosed);
    }

    #[test]
    fn test_cursor_throttle_sends_first_and_last() {
        let every = Duration::from_millis(400);
        let mut throttle = CursorThrottle::new(every);
        let start = Instant::now();

        assert_eq!(throttle.offer(1, start), Some(1));
        assert_eq!(throttle.deadline(), Some(start + every));
        assert_eq!(throttle.offer(2, start), None);
        assert_eq!(throttle.offer(3, start), None);

        // Window closes: the latest held position goes out and a new
        // window opens.
        let later = start + every;
        assert_eq!(throttle.fire(later), Some(3));
        assert_eq!(throttle.deadline(), Some(later + every));

        // Nothing arrived in the second window: the throttle goes quiet.
        assert_eq!(throttle.fire(later + every), None);
        assert_eq!(throttle.deadline(), None);
        assert_eq!(throttle.offer(4, later + every), Some(4));
    }

    #[test]
    fn test_jitter_stays_within_a_tenth() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base && d <= base + Duration::from_secs(3));
        }
    }
}
