//! Subscriber presence for Typeroom rooms.
//!
//! This crate answers "who is in this room, and are they here right now?"
//!
//! 1. **Membership**: the room record and its subscribers, seeded when a
//!    room is registered and trimmed when someone leaves.
//! 2. **Presence**: each subscriber's set of live connections. A
//!    subscriber is `active` exactly when that set is non-empty.
//! 3. **Game status**: each subscriber's progress in the current game.
//!
//! Connections expire on their own after a TTL. Nothing sweeps them in
//! the background; every operation that touches a subscriber prunes
//! expired connections first and corrects the status to match, so a
//! client that vanished without saying goodbye is healed on the next
//! read.
//!
//! # How it fits in the stack
//!
//! ```text
//! Fan-out adapter / Game manager (above)  ← report connects, read snapshots
//!     ↕
//! Presence (this crate)  ← [`PresenceStore`], async and shareable
//!     ↕
//! [`PresenceState`]  ← the synchronous state machine it guards
//! ```

mod config;
mod error;
mod state;
mod store;

pub use config::PresenceConfig;
pub use error::PresenceError;
pub use state::{PresenceState, PresenceStatus, SubscriberSnapshot};
pub use store::PresenceStore;
