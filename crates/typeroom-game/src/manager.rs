//! The game manager: every lifecycle operation plus the scheduled
//! countdown → play → results task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use typeroom_presence::PresenceStore;
use typeroom_protocol::{
    Cursor, EntryId, Game, GameId, GameStatus, PushMessage, RoomId, Score,
    ScoreInput, StreamAction, SubscriberGameStatus, TextId, UserId,
};
use typeroom_stream::{StreamStore, StreamTransport};

use crate::state::GameTable;
use crate::{GameConfig, GameError, Repository};

/// The scheduled task for a room's game, cancellable by game id.
struct Pending {
    game_id: GameId,
    cancel: CancellationToken,
}

struct Inner<S, R> {
    config: GameConfig,
    stream: StreamTransport<S>,
    presence: Arc<PresenceStore>,
    repo: Arc<R>,
    games: Mutex<GameTable>,
    pending: Mutex<HashMap<RoomId, Pending>>,
}

/// Runs the game lifecycle for every room.
///
/// Cheap to clone; clones share state. The scheduled task of each game
/// holds a clone.
pub struct GameManager<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for GameManager<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StreamStore, R: Repository> GameManager<S, R> {
    pub fn new(
        config: GameConfig,
        stream: StreamTransport<S>,
        presence: Arc<PresenceStore>,
        repo: Arc<R>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                stream,
                presence,
                repo,
                games: Mutex::new(GameTable::default()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.inner.config
    }

    // -- snapshots --------------------------------------------------------

    pub async fn current_game(&self, room: RoomId) -> Option<Game> {
        self.inner.games.lock().await.current(room).cloned()
    }

    /// Scores recorded so far for the room's current game, best first.
    pub async fn current_game_scores(&self, room: RoomId) -> Result<Vec<Score>, GameError> {
        match self.current_game(room).await {
            Some(game) => Ok(self.inner.repo.find_scores_by_game(game.id).await?),
            None => Ok(Vec::new()),
        }
    }

    // -- admin ------------------------------------------------------------

    /// Replaces the room's game with a fresh one on `text_id`.
    ///
    /// Admin only. Rejected while a game is counting down or being
    /// played. Cancels any scheduled task left over from the previous
    /// game and puts every subscriber back to unstarted.
    pub async fn create_new_game(
        &self,
        room: RoomId,
        admin: UserId,
        text_id: TextId,
    ) -> Result<Game, GameError> {
        let record = self.inner.presence.room(room).await?;
        if record.admin_id != admin {
            return Err(GameError::NotAdmin { room, user: admin });
        }
        if !self.inner.repo.text_exists(text_id).await? {
            return Err(GameError::TextNotFound(text_id));
        }

        let game = self.inner.games.lock().await.replace(room, text_id)?;
        self.cancel_pending(room).await;
        self.inner.presence.reset_game_statuses(room).await?;
        self.inner
            .stream
            .publish_push_message(room, &PushMessage::NewGame(game.clone()))
            .await?;

        tracing::info!(%room, game_id = %game.id, %text_id, "new game created");
        Ok(game)
    }

    // -- participants -----------------------------------------------------

    /// Adds a subscriber to the room's pending game.
    ///
    /// Allowed until the game has started playing. The join that brings
    /// the participant count to the quorum starts the countdown.
    pub async fn add_user_to_game(&self, room: RoomId, user: UserId) -> Result<Game, GameError> {
        if !self.inner.presence.is_subscriber(room, user).await {
            return Err(GameError::NotSubscriber { room, user });
        }

        let joined = self
            .inner
            .games
            .lock()
            .await
            .join(room, user, self.inner.config.quorum)?;

        tracing::info!(
            %room,
            game_id = %joined.game.id,
            %user,
            participants = joined.game.participants.len(),
            "user joined game"
        );

        // The join has committed. If it moved the game to countdown, the
        // schedule must run even when announcing the join fails.
        let announced = self.announce_started(room, user).await;
        if joined.countdown_started {
            self.begin_countdown(room, joined.game.id).await?;
        }
        announced?;
        Ok(joined.game)
    }

    async fn announce_started(&self, room: RoomId, user: UserId) -> Result<(), GameError> {
        self.inner
            .presence
            .set_game_status(room, user, SubscriberGameStatus::Started)
            .await?;
        self.inner
            .stream
            .publish_push_message(room, &PushMessage::UserStartedGame(user))
            .await?;
        Ok(())
    }

    /// Starts the countdown if the pending game has exactly reached the
    /// quorum and has not started it yet. Returns `true` if it did.
    pub async fn initiate_game_if_ready(&self, room: RoomId) -> Result<bool, GameError> {
        let started = self
            .inner
            .games
            .lock()
            .await
            .try_begin_countdown(room, self.inner.config.quorum)?;
        match started {
            Some(game_id) => {
                self.begin_countdown(room, game_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Records a participant's score.
    ///
    /// Accepted once per participant while the game is being played or
    /// finished but not yet ranked.
    pub async fn submit_score(
        &self,
        room: RoomId,
        user: UserId,
        input: ScoreInput,
    ) -> Result<Score, GameError> {
        input.validate().map_err(GameError::InvalidScore)?;

        let game_id = self
            .inner
            .games
            .lock()
            .await
            .reserve_submission(room, user, input.text_id)?;

        let score = Score::from_input(user, game_id, input);
        if let Err(e) = self.inner.repo.create_score(score.clone()).await {
            self.inner
                .games
                .lock()
                .await
                .release_submission(room, game_id, user);
            return Err(e.into());
        }

        self.inner
            .presence
            .set_game_status(room, user, SubscriberGameStatus::Finished)
            .await?;
        self.inner
            .stream
            .publish_push_message(room, &PushMessage::UserFinishedGame(user))
            .await?;
        self.inner
            .stream
            .publish_action(room, StreamAction::ScoreSubmitted { user_id: user })
            .await?;

        tracing::info!(
            %room,
            %game_id,
            %user,
            wpm = score.words_per_minute,
            accuracy = score.accuracy,
            "score submitted"
        );
        Ok(score)
    }

    // -- schedule ---------------------------------------------------------

    /// Announces the countdown and schedules the rest of the game.
    ///
    /// The game is already in countdown when this is called, so the task
    /// is scheduled even if the announcement fails; the error is
    /// returned afterwards.
    async fn begin_countdown(&self, room: RoomId, game_id: GameId) -> Result<(), GameError> {
        let countdown = self.inner.config.countdown;
        let announced = self
            .inner
            .stream
            .publish_push_message(
                room,
                &PushMessage::CountdownStart {
                    duration_secs: countdown.as_secs(),
                },
            )
            .await;
        let cursor = match &announced {
            Ok(id) => *id,
            Err(e) => {
                tracing::error!(%room, %game_id, error = %e, "failed to announce countdown");
                // No score can be submitted before the game starts.
                self.inner.stream.last_id(room).await.unwrap_or(EntryId::ZERO)
            }
        };
        let play = self.game_duration(room).await;
        tracing::info!(%room, %game_id, ?countdown, ?play, "countdown started");

        let cancel = CancellationToken::new();
        let previous = self.inner.pending.lock().await.insert(
            room,
            Pending {
                game_id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(%room, %game_id, "scheduled game task cancelled");
                }
                result = manager.run_schedule(room, game_id, cursor, play) => {
                    if let Err(e) = result {
                        tracing::error!(%room, %game_id, error = %e, "scheduled game task failed");
                    }
                }
            }
            manager.clear_pending(room, game_id).await;
        });
        announced?;
        Ok(())
    }

    async fn run_schedule(
        &self,
        room: RoomId,
        game_id: GameId,
        cursor: EntryId,
        play: Duration,
    ) -> Result<Vec<Score>, GameError> {
        tokio::time::sleep(self.inner.config.countdown).await;
        self.inner
            .games
            .lock()
            .await
            .advance(room, game_id, GameStatus::Started)?;
        tracing::info!(%room, %game_id, "game started");

        tokio::time::sleep(play).await;
        self.handle_game_results(room, game_id, cursor).await
    }

    /// Finishes the game and publishes its ranking.
    ///
    /// The status becomes finished first. Then this waits until every
    /// participant's `score_submitted` action has been seen (reading the
    /// room's actions after `since`) or the results timeout elapses,
    /// whichever comes first, and publishes whatever scores exist.
    pub async fn handle_game_results(
        &self,
        room: RoomId,
        game_id: GameId,
        since: EntryId,
    ) -> Result<Vec<Score>, GameError> {
        let game = self
            .inner
            .games
            .lock()
            .await
            .advance(room, game_id, GameStatus::Finished)?;
        tracing::info!(%room, %game_id, "game finished, collecting results");

        let expected: HashSet<UserId> = game.participants.iter().copied().collect();
        let mut actions = match self
            .inner
            .stream
            .subscribe_actions(room, Cursor::After(since))
            .await
        {
            Ok(actions) => Some(actions),
            Err(e) => {
                tracing::warn!(%room, %game_id, error = %e, "cannot read actions, waiting for timeout");
                None
            }
        };

        let all_in = async {
            let Some(actions) = actions.as_mut() else {
                return std::future::pending::<()>().await;
            };
            let mut seen = HashSet::new();
            while seen.len() < expected.len() {
                match actions.next().await {
                    Some(Ok(delivered)) => {
                        if let StreamAction::ScoreSubmitted { user_id } = delivered.item {
                            if expected.contains(&user_id) {
                                seen.insert(user_id);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%room, %game_id, error = %e, "action stream failed, waiting for timeout");
                        std::future::pending::<()>().await;
                    }
                    // Terminated: the room is going away.
                    None => break,
                }
            }
        };

        let all_received = tokio::select! {
            _ = all_in => true,
            _ = tokio::time::sleep(self.inner.config.results_wait) => false,
        };
        if let Some(actions) = &actions {
            actions.cancel();
        }

        self.inner.games.lock().await.close_results(room, game_id)?;
        let scores = self.inner.repo.find_scores_by_game(game_id).await?;
        self.inner
            .stream
            .publish_push_message(room, &PushMessage::GameScores(scores.clone()))
            .await?;

        tracing::info!(
            %room,
            %game_id,
            scores = scores.len(),
            participants = expected.len(),
            all_received,
            "results published"
        );
        Ok(scores)
    }

    // -- teardown ---------------------------------------------------------

    /// Cancels the room's scheduled task, if any. Returns `true` if one
    /// was pending.
    pub async fn cancel_pending(&self, room: RoomId) -> bool {
        match self.inner.pending.lock().await.remove(&room) {
            Some(pending) => {
                pending.cancel.cancel();
                tracing::debug!(%room, game_id = %pending.game_id, "pending game task cancelled");
                true
            }
            None => false,
        }
    }

    /// Returns `true` if a scheduled task is running for the room.
    pub async fn has_pending(&self, room: RoomId) -> bool {
        self.inner.pending.lock().await.contains_key(&room)
    }

    /// Drops all game state for a room being torn down.
    pub async fn remove_room(&self, room: RoomId) {
        self.cancel_pending(room).await;
        if self.inner.games.lock().await.remove(room) {
            tracing::debug!(%room, "game state removed");
        }
    }

    async fn clear_pending(&self, room: RoomId, game_id: GameId) {
        let mut pending = self.inner.pending.lock().await;
        if pending.get(&room).is_some_and(|p| p.game_id == game_id) {
            pending.remove(&room);
        }
    }

    async fn game_duration(&self, room: RoomId) -> Duration {
        match self.inner.presence.room(room).await {
            Ok(record) if record.game_duration_secs > 0 => {
                Duration::from_secs(u64::from(record.game_duration_secs))
            }
            _ => self.inner.config.default_game_duration,
        }
    }
}
