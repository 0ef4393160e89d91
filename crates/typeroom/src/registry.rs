//! Process-local registry of the connections attached to each room.
//!
//! The registry is owned by the server and handed to every connection
//! handler; there is no global. A room's entry is created by the first
//! connection that joins and dropped when the last one leaves.
//!
//! It exists for traffic that never touches the room's stream: cursor
//! updates are written straight to the other local connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use typeroom_protocol::{ConnectionId, RoomId, UserId};
use typeroom_transport::{Connection, TransportError};

/// One attached connection.
pub struct Peer<C> {
    pub user_id: UserId,
    pub conn: Arc<C>,
    /// Cancelled when the connection falls behind; its handler closes it.
    pub kick: CancellationToken,
}

impl<C> Clone for Peer<C> {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id,
            conn: Arc::clone(&self.conn),
            kick: self.kick.clone(),
        }
    }
}

pub struct RoomRegistry<C> {
    rooms: Mutex<HashMap<RoomId, HashMap<ConnectionId, Peer<C>>>>,
}

impl<C> Default for RoomRegistry<C> {
    fn default() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> RoomRegistry<C>
where
    C: Connection<Error = TransportError>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection, creating the room entry on first use. Returns
    /// how many connections the room has now.
    pub async fn join(&self, room: RoomId, peer: Peer<C>) -> usize {
        let mut rooms = self.rooms.lock().await;
        let created = !rooms.contains_key(&room);
        let peers = rooms.entry(room).or_default();
        peers.insert(peer.conn.id(), peer);
        if created {
            tracing::debug!(%room, "local room created");
        }
        peers.len()
    }

    /// Removes a connection. Returns `true` if that emptied the room and
    /// its entry was dropped.
    pub async fn leave(&self, room: RoomId, conn_id: ConnectionId) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(peers) = rooms.get_mut(&room) else {
            return false;
        };
        peers.remove(&conn_id);
        if peers.is_empty() {
            rooms.remove(&room);
            tracing::debug!(%room, "local room dropped");
            return true;
        }
        false
    }

    /// Writes `data` to every connection in the room except `from`.
    ///
    /// Never waits: a connection whose queue is full is kicked instead of
    /// stalling the sender. Returns how many connections accepted it.
    pub async fn broadcast(&self, room: RoomId, from: ConnectionId, data: &[u8]) -> usize {
        let rooms = self.rooms.lock().await;
        let Some(peers) = rooms.get(&room) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, peer) in peers.iter().filter(|(id, _)| **id != from) {
            match peer.conn.try_send(data) {
                Ok(()) => delivered += 1,
                Err(TransportError::BufferFull) => {
                    tracing::warn!(%room, %conn_id, user_id = %peer.user_id, "peer too slow, kicking");
                    peer.kick.cancel();
                }
                Err(e) => {
                    tracing::debug!(%room, %conn_id, error = %e, "fan-out to closing peer failed");
                }
            }
        }
        delivered
    }

    pub async fn connection_count(&self, room: RoomId) -> usize {
        self.rooms.lock().await.get(&room).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;

    fn peer(capacity: usize) -> (Peer<FakeConnection>, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let (conn, rx) = FakeConnection::new(capacity);
        let peer = Peer {
            user_id: UserId::new(),
            conn: Arc::new(conn),
            kick: CancellationToken::new(),
        };
        (peer, rx)
    }

    #[tokio::test]
    async fn test_room_lives_while_connections_remain() {
        let registry = RoomRegistry::new();
        let room = RoomId::new();
        let (a, _rx_a) = peer(4);
        let (b, _rx_b) = peer(4);
        let (a_id, b_id) = (a.conn.id(), b.conn.id());

        assert_eq!(registry.join(room, a).await, 1);
        assert_eq!(registry.join(room, b).await, 2);
        assert_eq!(registry.room_count().await, 1);

        assert!(!registry.leave(room, a_id).await);
        assert_eq!(registry.connection_count(room).await, 1);
        assert!(registry.leave(room, b_id).await);
        assert_eq!(registry.room_count().await, 0);

        // Leaving twice, or a room never joined, is harmless.
        assert!(!registry.leave(room, b_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_other_rooms() {
        let registry = RoomRegistry::new();
        let room = RoomId::new();
        let (a, mut rx_a) = peer(4);
        let (b, mut rx_b) = peer(4);
        let (elsewhere, mut rx_elsewhere) = peer(4);
        let a_id = a.conn.id();
        registry.join(room, a).await;
        registry.join(room, b).await;
        registry.join(RoomId::new(), elsewhere).await;

        assert_eq!(registry.broadcast(room, a_id, b"caret").await, 1);
        assert_eq!(rx_b.recv().await.unwrap(), b"caret".to_vec());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_elsewhere.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_peer_is_kicked_without_blocking_others() {
        let registry = RoomRegistry::new();
        let room = RoomId::new();
        let (sender, _rx_sender) = peer(4);
        let (slow, _rx_slow) = peer(1);
        let (fast, mut rx_fast) = peer(8);
        let sender_id = sender.conn.id();
        let slow_kick = slow.kick.clone();
        let fast_kick = fast.kick.clone();
        registry.join(room, sender).await;
        registry.join(room, slow).await;
        registry.join(room, fast).await;

        registry.broadcast(room, sender_id, b"1").await;
        assert!(!slow_kick.is_cancelled());
        registry.broadcast(room, sender_id, b"2").await;

        assert!(slow_kick.is_cancelled());
        assert!(!fast_kick.is_cancelled());
        assert_eq!(rx_fast.recv().await.unwrap(), b"1".to_vec());
        assert_eq!(rx_fast.recv().await.unwrap(), b"2".to_vec());
    }
}
