//! Identity types and the records that clients see in snapshots.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Declares an opaque UUID newtype.
///
/// Each id is a distinct type so a `RoomId` can never be passed where a
/// `UserId` is expected. `#[serde(transparent)]` keeps the JSON form a
/// plain UUID string.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifies a room: a group of users who play games together.
    RoomId
);
uuid_id!(
    /// Identifies a registered user.
    UserId
);
uuid_id!(
    /// Identifies one game instance within a room.
    GameId
);
uuid_id!(
    /// Identifies the text a game is typed against.
    TextId
);

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A member of a room as known to the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: UserId,
    pub username: String,
}

/// A room as loaded from the relational store.
///
/// The admin is always one of the members: [`RoomRecord::new`] inserts
/// them and [`RoomRecord::with_member`] never removes anyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub admin_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Length of the timed play window, in seconds.
    pub game_duration_secs: u32,
    pub members: Vec<RoomMember>,
}

impl RoomRecord {
    /// Creates a room administered (and joined) by `admin_id`.
    pub fn new(
        admin_id: UserId,
        admin_username: impl Into<String>,
        game_duration_secs: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RoomId::new(),
            admin_id,
            created_at: now,
            updated_at: now,
            game_duration_secs,
            members: vec![RoomMember {
                user_id: admin_id,
                username: admin_username.into(),
            }],
        }
    }

    /// Adds a member. Adding an existing member is a no-op.
    pub fn with_member(
        mut self,
        user_id: UserId,
        username: impl Into<String>,
    ) -> Self {
        if !self.has_member(user_id) {
            self.members.push(RoomMember {
                user_id,
                username: username.into(),
            });
        }
        self
    }

    /// Returns `true` if `user_id` belongs to the room.
    pub fn has_member(&self, user_id: UserId) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }
}

// ---------------------------------------------------------------------------
// Subscriber status
// ---------------------------------------------------------------------------

/// Whether a room subscriber has at least one live connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    #[default]
    Inactive,
    Active,
}

/// A subscriber's progress in the room's current game.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberGameStatus {
    #[default]
    Unstarted,
    Started,
    Finished,
}

/// Snapshot of one room subscriber, sent in the initial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSubscriber {
    pub user_id: UserId,
    pub username: String,
    pub status: SubscriberStatus,
    pub game_status: SubscriberGameStatus,
}

// ---------------------------------------------------------------------------
// GameStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a room's current game.
///
/// Transitions only move forward:
///
/// ```text
/// Unstarted → Countdown → Started → Finished
/// ```
///
/// - **Unstarted**: created by the admin, collecting participants.
/// - **Countdown**: quorum reached; clients count down locally.
/// - **Started**: timed play window is running.
/// - **Finished**: play is over; results are being collected or have
///   been published.
///
/// `Ord` follows the lifecycle order, so `status > GameStatus::Countdown`
/// reads as "has progressed past countdown".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Unstarted,
    Countdown,
    Started,
    Finished,
}

impl GameStatus {
    /// Returns `true` while the game occupies the room (countdown or
    /// play). At most one game per room may be in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Countdown | Self::Started)
    }

    /// Returns `true` if participants may still join.
    pub fn accepts_participants(&self) -> bool {
        *self <= Self::Countdown
    }

    /// Returns the next state, or `None` from `Finished`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Unstarted => Some(Self::Countdown),
            Self::Countdown => Some(Self::Started),
            Self::Started => Some(Self::Finished),
            Self::Finished => None,
        }
    }

    /// Returns `true` if moving to `target` keeps the lifecycle
    /// monotonic. Jumping straight to `Finished` is allowed from any
    /// earlier state (the results step may fire during countdown).
    pub fn can_transition_to(self, target: Self) -> bool {
        target > self
            && (self.next() == Some(target) || target == Self::Finished)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Countdown => write!(f, "countdown"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// A room's current game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub room_id: RoomId,
    pub text_id: TextId,
    pub status: GameStatus,
    /// Users who joined the game, in join order.
    pub participants: Vec<UserId>,
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// Error counts keyed by the mistyped character.
pub type ErrorHistogram = BTreeMap<String, u32>;

/// What a participant submits when their timed exercise ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreInput {
    pub text_id: TextId,
    pub words_typed: u32,
    pub time_elapsed_secs: f64,
    #[serde(default)]
    pub errors: ErrorHistogram,
}

impl ScoreInput {
    /// Rejects inputs that would produce a meaningless score.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.time_elapsed_secs.is_finite() && self.time_elapsed_secs > 0.0) {
            return Err("time elapsed must be a positive number of seconds".into());
        }
        Ok(())
    }
}

/// A participant's result for one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: Uuid,
    pub user_id: UserId,
    pub game_id: GameId,
    pub text_id: TextId,
    pub words_typed: u32,
    pub time_elapsed_secs: f64,
    pub errors: ErrorHistogram,
    pub number_errors: u32,
    pub words_per_minute: f64,
    pub accuracy: f64,
    pub created_at: DateTime<Utc>,
}

impl Score {
    /// Builds a score from a submission, deriving words-per-minute,
    /// the total error count, and accuracy. Accuracy is a percentage
    /// floored at 0 when there are more errors than words.
    pub fn from_input(user_id: UserId, game_id: GameId, input: ScoreInput) -> Self {
        let number_errors: u32 = input.errors.values().sum();
        let words_per_minute =
            f64::from(input.words_typed) * 60.0 / input.time_elapsed_secs;
        let accuracy = if input.words_typed == 0 {
            0.0
        } else {
            (100.0 - f64::from(number_errors) * 100.0 / f64::from(input.words_typed)).max(0.0)
        };

        Self {
            id: Uuid::new_v4(),
            user_id,
            game_id,
            text_id: input.text_id,
            words_typed: input.words_typed,
            time_elapsed_secs: input.time_elapsed_secs,
            errors: input.errors,
            number_errors,
            words_per_minute,
            accuracy,
            created_at: Utc::now(),
        }
    }
}
