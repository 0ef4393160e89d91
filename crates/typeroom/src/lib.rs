//! # Typeroom
//!
//! Real-time room and game coordination for typing contests.
//!
//! Clients attach to a room over a WebSocket and from then on receive
//! everything that happens in it: who came and went, new games, the
//! countdown, live cursors, and the final ranking. The server is the only
//! writer of each room's stream; connections are readers that can resume
//! from the last entry they saw.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use typeroom::prelude::*;
//!
//! # async fn run() -> Result<(), TyperoomError> {
//! typeroom::init_tracing("typeroom=info", false).ok();
//!
//! let server = TyperoomServerBuilder::new()
//!     .config(ServerConfig::from_env()?)
//!     .build(
//!         MemoryStreamStore::new(),
//!         Arc::new(MemoryRepository::new()),
//!         StaticAuthenticator::new(),
//!     )
//!     .await?;
//! server.run().await
//! # }
//! ```

mod auth;
mod config;
mod error;
mod handler;
mod registry;
mod room_service;
mod server;
mod telemetry;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, Authenticator, StaticAuthenticator};
pub use config::{ConnectionConfig, ServerConfig};
pub use error::TyperoomError;
pub use registry::{Peer, RoomRegistry};
pub use room_service::{Departure, RoomService};
pub use server::{TyperoomServer, TyperoomServerBuilder};
pub use telemetry::init_tracing;

pub mod prelude {
    pub use crate::{
        AuthError, Authenticator, ConnectionConfig, Departure, RoomService, ServerConfig,
        StaticAuthenticator, TyperoomError, TyperoomServer, TyperoomServerBuilder,
    };
    pub use typeroom_game::{GameConfig, GameError, GameManager, MemoryRepository, Repository};
    pub use typeroom_presence::{PresenceConfig, PresenceStore};
    pub use typeroom_protocol::{
        ClientFrame, Cursor, EntryId, Game, GameId, GameStatus, PushMessage, RoomId, RoomRecord,
        Score, ScoreInput, ServerFrame, TextId, UserId,
    };
    pub use typeroom_stream::{MemoryStreamStore, StreamConfig, StreamStore, StreamTransport};
}
