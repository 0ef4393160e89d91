//! Shared, async access to [`PresenceState`].

use tokio::sync::Mutex;
use tokio::time::Instant;
use typeroom_protocol::{
    ConnectionId, RoomId, RoomRecord, SubscriberGameStatus, UserId,
};

use crate::{
    PresenceConfig, PresenceError, PresenceState, PresenceStatus,
    SubscriberSnapshot,
};

/// The presence store shared by connection handlers and the game
/// manager.
///
/// Each method takes the lock once, so a check and the update that
/// depends on it can never interleave with another caller's.
pub struct PresenceStore {
    state: Mutex<PresenceState>,
}

impl PresenceStore {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            state: Mutex::new(PresenceState::new(config.connection_ttl)),
        }
    }

    pub async fn register_room(&self, record: RoomRecord) -> Result<(), PresenceError> {
        let room_id = record.id;
        self.state.lock().await.register_room(record)?;
        tracing::info!(%room_id, "room registered");
        Ok(())
    }

    pub async fn add_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &str,
    ) -> Result<bool, PresenceError> {
        self.state.lock().await.add_member(room_id, user_id, username)
    }

    pub async fn remove_subscriber(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<bool, PresenceError> {
        let removed = self.state.lock().await.remove_subscriber(room_id, user_id)?;
        if removed {
            tracing::info!(%room_id, %user_id, "subscriber removed");
        }
        Ok(removed)
    }

    pub async fn delete_room(&self, room_id: RoomId) -> bool {
        self.state.lock().await.delete_room(room_id)
    }

    /// Returns a copy of the room record, members included.
    pub async fn room(&self, room_id: RoomId) -> Result<RoomRecord, PresenceError> {
        self.state.lock().await.room(room_id).cloned()
    }

    pub async fn is_subscriber(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.state.lock().await.is_subscriber(room_id, user_id)
    }

    /// Adds or refreshes a connection. `true` means the subscriber just
    /// became active.
    pub async fn add_connection(
        &self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, PresenceError> {
        let transitioned = self.state.lock().await.add_connection(
            room_id,
            user_id,
            connection_id,
            Instant::now(),
        )?;
        tracing::debug!(%room_id, %user_id, %connection_id, transitioned, "connection added");
        Ok(transitioned)
    }

    /// Removes a connection. `true` means it was the subscriber's last
    /// live one.
    pub async fn remove_connection(
        &self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, PresenceError> {
        let transitioned = self.state.lock().await.remove_connection(
            room_id,
            user_id,
            connection_id,
            Instant::now(),
        )?;
        tracing::debug!(%room_id, %user_id, %connection_id, transitioned, "connection removed");
        Ok(transitioned)
    }

    pub async fn get_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<PresenceStatus, PresenceError> {
        let status = self
            .state
            .lock()
            .await
            .status(room_id, user_id, Instant::now())?;
        if status.transitioned {
            tracing::debug!(%room_id, %user_id, status = ?status.status, "stale presence corrected");
        }
        Ok(status)
    }

    pub async fn get_all_subscribers(
        &self,
        room_id: RoomId,
    ) -> Result<SubscriberSnapshot, PresenceError> {
        self.state
            .lock()
            .await
            .subscribers(room_id, Instant::now())
    }

    pub async fn game_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<SubscriberGameStatus, PresenceError> {
        self.state.lock().await.game_status(room_id, user_id)
    }

    pub async fn set_game_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
        status: SubscriberGameStatus,
    ) -> Result<(), PresenceError> {
        self.state
            .lock()
            .await
            .set_game_status(room_id, user_id, status)
    }

    pub async fn reset_game_statuses(&self, room_id: RoomId) -> Result<(), PresenceError> {
        self.state.lock().await.reset_game_statuses(room_id)
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}
