//! Room membership and teardown.
//!
//! Rooms live in the relational store; the server mirrors one into the
//! presence store the first time someone attaches to it. Leaving is the
//! only path that destroys anything: when the admin leaves, the whole
//! room goes, live subscriptions first.

use std::sync::Arc;

use typeroom_game::{GameManager, Repository};
use typeroom_presence::{PresenceError, PresenceStore};
use typeroom_protocol::{PushMessage, RoomId, RoomRecord, StreamAction, UserId};
use typeroom_stream::{StreamStore, StreamTransport};

use crate::TyperoomError;

/// What [`RoomService::leave_room`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// A member left; the room carries on.
    MemberLeft,
    /// The admin left and the room was deleted.
    RoomDeleted,
    /// The user was not a member.
    NotMember,
}

pub struct RoomService<S, R> {
    stream: StreamTransport<S>,
    presence: Arc<PresenceStore>,
    games: GameManager<S, R>,
    repo: Arc<R>,
}

impl<S, R> Clone for RoomService<S, R> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            presence: Arc::clone(&self.presence),
            games: self.games.clone(),
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<S: StreamStore, R: Repository> RoomService<S, R> {
    pub fn new(
        stream: StreamTransport<S>,
        presence: Arc<PresenceStore>,
        games: GameManager<S, R>,
        repo: Arc<R>,
    ) -> Self {
        Self {
            stream,
            presence,
            games,
            repo,
        }
    }

    /// Seeds presence with a room and its members, all inactive and
    /// unstarted. Registering a known room adds any new members.
    pub async fn register_room(&self, record: RoomRecord) -> Result<(), TyperoomError> {
        self.presence.register_room(record).await?;
        Ok(())
    }

    /// Makes sure the room is in the presence store, loading it from the
    /// repository if this process has not seen it yet.
    pub async fn ensure_room(&self, room: RoomId) -> Result<RoomRecord, TyperoomError> {
        match self.presence.room(room).await {
            Ok(record) => Ok(record),
            Err(PresenceError::RoomNotFound(_)) => {
                let record = self
                    .repo
                    .find_room(room)
                    .await?
                    .ok_or(PresenceError::RoomNotFound(room))?;
                self.presence.register_room(record).await?;
                Ok(self.presence.room(room).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Adds a member to a registered room.
    pub async fn add_member(
        &self,
        room: RoomId,
        user: UserId,
        username: &str,
    ) -> Result<bool, TyperoomError> {
        let added = self.presence.add_member(room, user, username).await?;
        if added {
            tracing::info!(%room, %user, "member added");
        }
        Ok(added)
    }

    /// Removes `user` from the room. The admin leaving deletes the room.
    pub async fn leave_room(&self, room: RoomId, user: UserId) -> Result<Departure, TyperoomError> {
        let record = self.presence.room(room).await?;
        if record.admin_id == user {
            self.delete_room(room).await?;
            return Ok(Departure::RoomDeleted);
        }

        if !self.presence.remove_subscriber(room, user).await? {
            return Ok(Departure::NotMember);
        }
        self.stream
            .publish_push_message(room, &PushMessage::UserLeft(user))
            .await?;
        Ok(Departure::MemberLeft)
    }

    /// Tears a room down.
    ///
    /// `terminate` goes out first so every reader of the stream stops
    /// cleanly, then the scheduled game task is cancelled and the
    /// presence, game and stream state are dropped. Returns `false` if
    /// the room was unknown.
    pub async fn delete_room(&self, room: RoomId) -> Result<bool, TyperoomError> {
        self.stream.publish_action(room, StreamAction::Terminate).await?;
        self.games.remove_room(room).await;
        let existed = self.presence.delete_room(room).await;
        self.stream.delete(room).await?;

        tracing::info!(%room, existed, "room deleted");
        Ok(existed)
    }
}
