//! Current-game table: the synchronous half of the lifecycle.
//!
//! Every method is one atomic step under the manager's lock. The async
//! side effects (publishing, scheduling, persisting) happen in
//! [`GameManager`](crate::GameManager) after the step has committed.

use std::collections::{HashMap, HashSet};

use typeroom_protocol::{Game, GameId, GameStatus, RoomId, TextId, UserId};

use crate::GameError;

#[derive(Debug)]
struct GameSlot {
    game: Game,
    /// Participants whose score is persisted or being persisted.
    submitted: HashSet<UserId>,
    results_published: bool,
}

/// What a join changed.
#[derive(Debug, Clone)]
pub(crate) struct Joined {
    pub game: Game,
    /// This join reached the quorum and moved the game to countdown.
    pub countdown_started: bool,
}

#[derive(Debug, Default)]
pub(crate) struct GameTable {
    rooms: HashMap<RoomId, GameSlot>,
}

impl GameTable {
    pub fn current(&self, room: RoomId) -> Option<&Game> {
        self.rooms.get(&room).map(|slot| &slot.game)
    }

    /// Replaces the room's game with a fresh unstarted one.
    ///
    /// Rejected while the current game is counting down or being played.
    pub fn replace(&mut self, room: RoomId, text_id: TextId) -> Result<Game, GameError> {
        if self.current(room).is_some_and(|g| g.status.is_active()) {
            return Err(GameError::GameInProgress(room));
        }
        let game = Game {
            id: GameId::new(),
            room_id: room,
            text_id,
            status: GameStatus::Unstarted,
            participants: Vec::new(),
        };
        self.rooms.insert(
            room,
            GameSlot {
                game: game.clone(),
                submitted: HashSet::new(),
                results_published: false,
            },
        );
        Ok(game)
    }

    /// Adds a participant and, if that brings the count to exactly
    /// `quorum`, starts the countdown in the same step.
    pub fn join(&mut self, room: RoomId, user: UserId, quorum: usize) -> Result<Joined, GameError> {
        let slot = self.slot_mut(room)?;
        let game = &mut slot.game;
        if !game.status.accepts_participants() {
            return Err(GameError::WrongStatus {
                game: game.id,
                status: game.status,
            });
        }
        if game.participants.contains(&user) {
            return Err(GameError::AlreadyJoined { game: game.id, user });
        }
        game.participants.push(user);

        let countdown_started = self.try_begin_countdown(room, quorum)?.is_some();
        let game = self.slot_mut(room)?.game.clone();
        Ok(Joined {
            game,
            countdown_started,
        })
    }

    /// Moves an unstarted game with exactly `quorum` participants to
    /// countdown. Returns the game id if it moved.
    pub fn try_begin_countdown(
        &mut self,
        room: RoomId,
        quorum: usize,
    ) -> Result<Option<GameId>, GameError> {
        let game = &mut self.slot_mut(room)?.game;
        if game.status == GameStatus::Unstarted && game.participants.len() == quorum {
            game.status = GameStatus::Countdown;
            return Ok(Some(game.id));
        }
        Ok(None)
    }

    /// Moves game `game_id` forward to `to`.
    ///
    /// Fails with [`GameError::Superseded`] if the room's current game
    /// is a different one by now.
    pub fn advance(
        &mut self,
        room: RoomId,
        game_id: GameId,
        to: GameStatus,
    ) -> Result<Game, GameError> {
        let slot = self.slot_for(room, game_id)?;
        if !slot.game.status.can_transition_to(to) {
            return Err(GameError::WrongStatus {
                game: game_id,
                status: slot.game.status,
            });
        }
        slot.game.status = to;
        Ok(slot.game.clone())
    }

    /// Claims the right to submit a score for `user`.
    ///
    /// Scores are accepted while the game is started, and after it
    /// finished until results are published.
    pub fn reserve_submission(
        &mut self,
        room: RoomId,
        user: UserId,
        text_id: TextId,
    ) -> Result<GameId, GameError> {
        let slot = self.slot_mut(room)?;
        let game = &slot.game;
        let open = matches!(game.status, GameStatus::Started | GameStatus::Finished)
            && !slot.results_published;
        if !open {
            return Err(GameError::WrongStatus {
                game: game.id,
                status: game.status,
            });
        }
        if !game.participants.contains(&user) {
            return Err(GameError::NotParticipant { game: game.id, user });
        }
        if game.text_id != text_id {
            return Err(GameError::InvalidScore(format!(
                "score is for text {text_id}, game {} uses text {}",
                game.id, game.text_id
            )));
        }
        if !slot.submitted.insert(user) {
            return Err(GameError::AlreadySubmitted { game: game.id, user });
        }
        Ok(game.id)
    }

    /// Gives back a reservation whose score could not be persisted.
    pub fn release_submission(&mut self, room: RoomId, game_id: GameId, user: UserId) {
        if let Ok(slot) = self.slot_for(room, game_id) {
            slot.submitted.remove(&user);
        }
    }

    /// Closes score submission for `game_id`.
    pub fn close_results(&mut self, room: RoomId, game_id: GameId) -> Result<(), GameError> {
        self.slot_for(room, game_id)?.results_published = true;
        Ok(())
    }

    pub fn remove(&mut self, room: RoomId) -> bool {
        self.rooms.remove(&room).is_some()
    }

    fn slot_mut(&mut self, room: RoomId) -> Result<&mut GameSlot, GameError> {
        self.rooms.get_mut(&room).ok_or(GameError::NoCurrentGame(room))
    }

    fn slot_for(&mut self, room: RoomId, game_id: GameId) -> Result<&mut GameSlot, GameError> {
        let slot = self.slot_mut(room)?;
        if slot.game.id != game_id {
            return Err(GameError::Superseded(game_id));
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_game() -> (GameTable, RoomId, Game) {
        let mut table = GameTable::default();
        let room = RoomId::new();
        let game = table.replace(room, TextId::new()).unwrap();
        (table, room, game)
    }

    #[test]
    fn test_countdown_starts_exactly_at_quorum() {
        let (mut table, room, _) = table_with_game();

        let first = table.join(room, UserId::new(), 2).unwrap();
        assert!(!first.countdown_started);
        assert_eq!(first.game.status, GameStatus::Unstarted);

        let second = table.join(room, UserId::new(), 2).unwrap();
        assert!(second.countdown_started);
        assert_eq!(second.game.status, GameStatus::Countdown);

        // A third participant may still join during countdown but does
        // not restart it.
        let third = table.join(room, UserId::new(), 2).unwrap();
        assert!(!third.countdown_started);
        assert_eq!(third.game.participants.len(), 3);
        assert_eq!(table.try_begin_countdown(room, 2).unwrap(), None);
    }

    #[test]
    fn test_join_rejected_after_countdown() {
        let (mut table, room, game) = table_with_game();
        table.join(room, UserId::new(), 2).unwrap();
        table.join(room, UserId::new(), 2).unwrap();
        table.advance(room, game.id, GameStatus::Started).unwrap();

        let err = table.join(room, UserId::new(), 2).unwrap_err();
        assert!(matches!(
            err,
            GameError::WrongStatus {
                status: GameStatus::Started,
                ..
            }
        ));
    }

    #[test]
    fn test_join_twice_is_rejected() {
        let (mut table, room, _) = table_with_game();
        let user = UserId::new();
        table.join(room, user, 2).unwrap();
        let err = table.join(room, user, 2).unwrap_err();
        assert!(matches!(err, GameError::AlreadyJoined { .. }));
    }

    #[test]
    fn test_replace_rejected_while_active() {
        let (mut table, room, game) = table_with_game();
        table.join(room, UserId::new(), 2).unwrap();
        table.join(room, UserId::new(), 2).unwrap();
        assert!(matches!(
            table.replace(room, TextId::new()),
            Err(GameError::GameInProgress(_))
        ));

        table.advance(room, game.id, GameStatus::Started).unwrap();
        assert!(table.replace(room, TextId::new()).is_err());

        table.advance(room, game.id, GameStatus::Finished).unwrap();
        let next = table.replace(room, TextId::new()).unwrap();
        assert_ne!(next.id, game.id);
        assert!(next.participants.is_empty());
    }

    #[test]
    fn test_advance_on_replaced_game_is_superseded() {
        let (mut table, room, old) = table_with_game();
        table.replace(room, TextId::new()).unwrap();
        let err = table.advance(room, old.id, GameStatus::Finished).unwrap_err();
        assert!(matches!(err, GameError::Superseded(id) if id == old.id));
    }

    #[test]
    fn test_advance_never_goes_backwards() {
        let (mut table, room, game) = table_with_game();
        table.advance(room, game.id, GameStatus::Finished).unwrap();
        assert!(table.advance(room, game.id, GameStatus::Started).is_err());
    }

    #[test]
    fn test_submission_window() {
        let (mut table, room, game) = table_with_game();
        let user = UserId::new();
        table.join(room, user, 2).unwrap();
        table.join(room, UserId::new(), 2).unwrap();

        // Still counting down.
        assert!(table.reserve_submission(room, user, game.text_id).is_err());

        table.advance(room, game.id, GameStatus::Started).unwrap();
        assert_eq!(
            table.reserve_submission(room, user, game.text_id).unwrap(),
            game.id
        );
        assert!(matches!(
            table.reserve_submission(room, user, game.text_id),
            Err(GameError::AlreadySubmitted { .. })
        ));

        table.release_submission(room, game.id, user);
        table.advance(room, game.id, GameStatus::Finished).unwrap();
        assert!(table.reserve_submission(room, user, game.text_id).is_ok());

        table.close_results(room, game.id).unwrap();
        table.release_submission(room, game.id, user);
        assert!(table.reserve_submission(room, user, game.text_id).is_err());
    }

    #[test]
    fn test_submission_requires_participant_and_matching_text() {
        let (mut table, room, game) = table_with_game();
        let user = UserId::new();
        table.join(room, user, 2).unwrap();
        table.join(room, UserId::new(), 2).unwrap();
        table.advance(room, game.id, GameStatus::Started).unwrap();

        assert!(matches!(
            table.reserve_submission(room, UserId::new(), game.text_id),
            Err(GameError::NotParticipant { .. })
        ));
        assert!(matches!(
            table.reserve_submission(room, user, TextId::new()),
            Err(GameError::InvalidScore(_))
        ));
    }
}
