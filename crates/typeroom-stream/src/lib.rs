//! Replayable per-room streams for Typeroom.
//!
//! Each room has one append-only log carrying two kinds of entries:
//! push messages for clients and control actions for the server. Every
//! entry gets an increasing [`EntryId`](typeroom_protocol::EntryId), so a
//! reader can resume exactly after the last entry it saw.
//!
//! - [`StreamStore`] is the storage backend; [`MemoryStreamStore`] keeps
//!   logs in process.
//! - [`StreamTransport`] publishes typed messages and opens
//!   [`Subscription`]s.
//! - A subscription runs one decode function per entry and yields
//!   [`Decoded::Keep`] items until it is cancelled, sees a terminate
//!   action, or hits an error.

mod config;
mod error;
mod store;
mod subscription;
mod transport;

pub use config::StreamConfig;
pub use error::StreamError;
pub use store::{EntryKind, MemoryStreamStore, RawEntry, StreamStore};
pub use subscription::{Decoded, Delivered, Subscription};
pub use transport::StreamTransport;
