//! Boundary to the relational store.
//!
//! The game layer needs four things from durable storage: write a score,
//! read a game's scores ranked by speed, load a room with its members,
//! and check that a text exists. Not-found is an empty result, never an
//! error, so reads stay idempotent.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use tokio::sync::Mutex;
use typeroom_protocol::{GameId, RoomId, RoomRecord, Score, TextId};

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The store could not be reached.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// A write violated a uniqueness constraint.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Durable storage used by the game lifecycle and the room service.
pub trait Repository: Send + Sync + 'static {
    /// Persists a score. At most one score per user and game.
    fn create_score(
        &self,
        score: Score,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Scores for a game, highest words per minute first.
    fn find_scores_by_game(
        &self,
        game_id: GameId,
    ) -> impl Future<Output = Result<Vec<Score>, RepositoryError>> + Send;

    /// A room with its member list, or `None`.
    fn find_room(
        &self,
        room_id: RoomId,
    ) -> impl Future<Output = Result<Option<RoomRecord>, RepositoryError>> + Send;

    fn text_exists(
        &self,
        text_id: TextId,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}

#[derive(Default)]
struct Tables {
    scores: Vec<Score>,
    rooms: HashMap<RoomId, RoomRecord>,
    texts: HashSet<TextId>,
}

/// In-process [`Repository`].
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_room(&self, room: RoomRecord) {
        self.tables.lock().await.rooms.insert(room.id, room);
    }

    pub async fn insert_text(&self, text_id: TextId) {
        self.tables.lock().await.texts.insert(text_id);
    }
}

impl Repository for MemoryRepository {
    async fn create_score(&self, score: Score) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let duplicate = tables
            .scores
            .iter()
            .any(|s| s.game_id == score.game_id && s.user_id == score.user_id);
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "score for user {} in game {} already exists",
                score.user_id, score.game_id
            )));
        }
        tables.scores.push(score);
        Ok(())
    }

    async fn find_scores_by_game(
        &self,
        game_id: GameId,
    ) -> Result<Vec<Score>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut scores: Vec<Score> = tables
            .scores
            .iter()
            .filter(|s| s.game_id == game_id)
            .cloned()
            .collect();
        scores.sort_by(|a, b| b.words_per_minute.total_cmp(&a.words_per_minute));
        Ok(scores)
    }

    async fn find_room(
        &self,
        room_id: RoomId,
    ) -> Result<Option<RoomRecord>, RepositoryError> {
        Ok(self.tables.lock().await.rooms.get(&room_id).cloned())
    }

    async fn text_exists(&self, text_id: TextId) -> Result<bool, RepositoryError> {
        Ok(self.tables.lock().await.texts.contains(&text_id))
    }
}
