//! Game lifecycle management for Typeroom.
//!
//! Each room has at most one current game. It moves strictly forward
//! through `unstarted → countdown → started → finished`:
//!
//! 1. The admin creates a game ([`GameManager::create_new_game`]).
//! 2. Subscribers join it. The join that brings the participant count to
//!    the quorum starts the countdown, exactly once.
//! 3. A scheduled task, owned by the manager and cancellable per room,
//!    waits out the countdown and the play window, then collects
//!    results: it waits for every participant's score or for the results
//!    timeout, whichever is first, and publishes the ranking.
//!
//! # Key types
//!
//! - [`GameManager`]: every lifecycle operation
//! - [`Repository`]: the relational store boundary (scores, rooms, texts)
//! - [`MemoryRepository`]: in-process `Repository`
//! - [`GameConfig`]: quorum and timing

mod config;
mod error;
mod manager;
mod repository;
mod state;

pub use config::GameConfig;
pub use error::GameError;
pub use manager::GameManager;
pub use repository::{MemoryRepository, Repository, RepositoryError};
