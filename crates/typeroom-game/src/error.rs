//! Error types for the game layer.

use typeroom_presence::PresenceError;
use typeroom_protocol::{GameId, GameStatus, RoomId, TextId, UserId};
use typeroom_stream::StreamError;

use crate::RepositoryError;

/// Errors that can occur during game operations.
///
/// Most variants are state-invariant rejections: the operation was a
/// no-op and the caller decides whether to tell the user.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Only the room's admin may do this.
    #[error("user {user} is not the admin of room {room}")]
    NotAdmin { room: RoomId, user: UserId },

    /// The user is not a subscriber of the room.
    #[error("user {user} is not a subscriber of room {room}")]
    NotSubscriber { room: RoomId, user: UserId },

    /// The user did not join the current game.
    #[error("user {user} is not a participant of game {game}")]
    NotParticipant { game: GameId, user: UserId },

    /// The room has no current game.
    #[error("room {0} has no current game")]
    NoCurrentGame(RoomId),

    /// The requested text does not exist.
    #[error("text {0} not found")]
    TextNotFound(TextId),

    /// A game in the room is counting down or being played.
    #[error("room {0} already has a game in progress")]
    GameInProgress(RoomId),

    /// The game has progressed past the point where this is allowed.
    #[error("game {game} is {status}")]
    WrongStatus { game: GameId, status: GameStatus },

    /// The user already joined the current game.
    #[error("user {user} already joined game {game}")]
    AlreadyJoined { game: GameId, user: UserId },

    /// The user already submitted a score for the current game.
    #[error("user {user} already submitted a score for game {game}")]
    AlreadySubmitted { game: GameId, user: UserId },

    /// The game was replaced by a newer one.
    #[error("game {0} is no longer the current game")]
    Superseded(GameId),

    /// The submitted score is not usable.
    #[error("invalid score: {0}")]
    InvalidScore(String),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl GameError {
    /// HTTP-style status code for reporting to a client.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidScore(_) => 400,
            Self::NotAdmin { .. }
            | Self::NotSubscriber { .. }
            | Self::NotParticipant { .. } => 403,
            Self::NoCurrentGame(_) | Self::TextNotFound(_) => 404,
            Self::Presence(PresenceError::RoomNotFound(_))
            | Self::Presence(PresenceError::SubscriberNotFound { .. }) => 404,
            Self::GameInProgress(_)
            | Self::WrongStatus { .. }
            | Self::AlreadyJoined { .. }
            | Self::AlreadySubmitted { .. }
            | Self::Superseded(_) => 409,
            Self::Presence(_) | Self::Stream(_) | Self::Repository(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_map_to_client_codes() {
        let room = RoomId::new();
        let user = UserId::new();
        assert_eq!(GameError::NotAdmin { room, user }.code(), 403);
        assert_eq!(GameError::NoCurrentGame(room).code(), 404);
        assert_eq!(GameError::GameInProgress(room).code(), 409);
        assert_eq!(GameError::InvalidScore("nope".into()).code(), 400);
        assert_eq!(
            GameError::Presence(PresenceError::RoomNotFound(room)).code(),
            404
        );
    }

    #[test]
    fn test_wrong_status_display() {
        let game = GameId::new();
        let err = GameError::WrongStatus {
            game,
            status: GameStatus::Started,
        };
        assert_eq!(err.to_string(), format!("game {game} is started"));
    }

    #[test]
    fn test_backend_failures_are_server_errors() {
        let err = GameError::from(RepositoryError::Unavailable("db down".into()));
        assert_eq!(err.code(), 500);
        assert_eq!(err.to_string(), "repository unavailable: db down");
    }
}
