//! Wire protocol and shared data model for Typeroom.
//!
//! This crate defines the "language" spoken between the coordination
//! engine's layers and its clients:
//!
//! - **Identity** ([`RoomId`], [`UserId`], [`GameId`], [`TextId`]) are
//!   opaque UUID newtypes.
//! - **Stream entries** ([`EntryId`], [`Cursor`], [`StreamAction`],
//!   [`PushMessage`]) are what travels through a room's replayable log.
//! - **Records** ([`RoomRecord`], [`Game`], [`Score`],
//!   [`RoomSubscriber`]) are the state clients see in snapshots.
//! - **Frames** ([`ClientFrame`], [`ServerFrame`]) are what travels over a
//!   live connection.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) turns those messages into
//!   bytes and back.
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (frames, entries) → Stream / Presence / Game
//! ```

mod codec;
mod entry;
mod error;
mod message;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use entry::{Cursor, EntryId};
pub use error::ProtocolError;
pub use message::{
    ClientFrame, CursorUpdate, InitialState, PushMessage, ServerFrame,
    StreamAction,
};
pub use types::{
    ErrorHistogram, Game, GameId, GameStatus, RoomId, RoomMember,
    RoomRecord, RoomSubscriber, Score, ScoreInput, SubscriberGameStatus,
    SubscriberStatus, TextId, UserId,
};

/// Re-exported so downstream crates name connections the same way.
pub use typeroom_transport::ConnectionId;
