//! Error types for the presence layer.

use typeroom_protocol::{RoomId, UserId};

/// Errors that can occur while reading or updating presence.
///
/// Stale connections are never an error: they are pruned silently and
/// show up only as a `transitioned` flag.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// No room with this id is registered.
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    /// The user is not a subscriber of the room.
    #[error("user {user} is not a subscriber of room {room}")]
    SubscriberNotFound { room: RoomId, user: UserId },

    /// A room was registered without its admin among the members.
    #[error("admin {admin} of room {room} is not a member")]
    AdminNotMember { room: RoomId, admin: UserId },
}
