//! Stream payloads and connection frames.
//!
//! Two families of messages live here:
//!
//! - What a room's stream carries: [`PushMessage`] (fanned out to every
//!   connection) and [`StreamAction`] (control signals for the server's
//!   own consumers).
//! - What a live connection carries: [`ClientFrame`] inbound and
//!   [`ServerFrame`] outbound.
//!
//! ## Wire format
//!
//! Push messages are adjacently tagged so the payload shape is uniform
//! for clients:
//!
//! ```json
//! { "type": "user_joined", "payload": "6f1c…" }
//! { "type": "countdown_start", "payload": { "duration_secs": 5 } }
//! ```
//!
//! Frames are internally tagged on `type`:
//!
//! ```json
//! { "type": "attach", "token": "…", "room_id": "…", "last_seen": "17…-0" }
//! { "type": "push", "id": "17…-0", "message": { "type": "new_game", … } }
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    ConnectionId, EntryId, Game, RoomId, RoomRecord, RoomSubscriber, Score,
    UserId,
};

/// A user's caret position in the shared text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub user_id: UserId,
    pub position: u32,
}

/// Snapshot sent to a connection right after it attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    pub room: RoomRecord,
    pub subscribers: Vec<RoomSubscriber>,
    pub game: Option<Game>,
    /// Scores already recorded for `game`, best first.
    pub scores: Vec<Score>,
}

/// A typed payload pushed to every connection in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushMessage {
    /// A subscriber went from inactive to active.
    UserJoined(UserId),
    /// The admin created a fresh game for the room.
    NewGame(Game),
    /// A caret moved. Fanned out locally, never appended to the stream.
    Cursor(CursorUpdate),
    /// Quorum was reached; clients count down for `duration_secs`.
    CountdownStart { duration_secs: u64 },
    /// A subscriber's last connection went away.
    UserLeft(UserId),
    InitialState(Box<InitialState>),
    /// Final results, ordered by words per minute, best first.
    GameScores(Vec<Score>),
    /// A subscriber joined the pending game.
    UserStartedGame(UserId),
    /// A participant submitted their score.
    UserFinishedGame(UserId),
}

impl PushMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined(_) => "user_joined",
            Self::NewGame(_) => "new_game",
            Self::Cursor(_) => "cursor",
            Self::CountdownStart { .. } => "countdown_start",
            Self::UserLeft(_) => "user_left",
            Self::InitialState(_) => "initial_state",
            Self::GameScores(_) => "game_scores",
            Self::UserStartedGame(_) => "user_started_game",
            Self::UserFinishedGame(_) => "user_finished_game",
        }
    }
}

/// A control signal consumed by the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StreamAction {
    /// The room is being torn down; every reader stops.
    Terminate,
    /// A participant's score has been persisted.
    ScoreSubmitted { user_id: UserId },
}

/// A frame sent by a client over its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame. `last_seen` resumes the stream after a
    /// reconnect.
    Attach {
        token: String,
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<EntryId>,
    },
    Cursor {
        position: u32,
    },
    Ping,
}

/// A frame sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Attached {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// A push message. `id` is set when it was delivered from the room's
    /// stream and can be used as `last_seen` on reconnect.
    Push {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<EntryId>,
        message: PushMessage,
    },
    Pong,
    Error {
        code: u16,
        message: String,
    },
}

impl ServerFrame {
    /// Wraps a push message that did not come from the stream.
    pub fn local(message: PushMessage) -> Self {
        Self::Push { id: None, message }
    }

    /// Wraps a push message delivered from stream entry `id`.
    pub fn entry(id: EntryId, message: PushMessage) -> Self {
        Self::Push {
            id: Some(id),
            message,
        }
    }
}
