//! Unified error type for the Typeroom server.

use typeroom_game::{GameError, RepositoryError};
use typeroom_presence::PresenceError;
use typeroom_protocol::{ProtocolError, RoomId, UserId};
use typeroom_stream::StreamError;
use typeroom_transport::TransportError;

use crate::AuthError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TyperoomError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The client broke the attach handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An authenticated user tried to attach to a room they do not
    /// belong to.
    #[error("user {user} is not a subscriber of room {room}")]
    NotSubscriber { room: RoomId, user: UserId },

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TyperoomError {
    /// HTTP-style status code sent to the client in an error frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::Handshake(_) | Self::Protocol(_) | Self::Config(_) => 400,
            Self::Auth(_) => 401,
            Self::NotSubscriber { .. } => 403,
            Self::Presence(PresenceError::AdminNotMember { .. }) => 400,
            Self::Presence(_) => 404,
            Self::Game(e) => e.code(),
            Self::Transport(_) | Self::Stream(_) | Self::Repository(_) => 500,
        }
    }
}
