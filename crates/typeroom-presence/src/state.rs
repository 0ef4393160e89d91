//! The presence state machine.
//!
//! `PresenceState` is a plain, synchronous structure. It is not
//! thread-safe by itself; [`PresenceStore`](crate::PresenceStore) owns
//! one behind a lock so every method here runs as a single atomic
//! read-modify-write.
//!
//! Every method that looks at a subscriber's connections takes `now` and
//! prunes expired entries before doing anything else.
//!
//! ```text
//!              add_connection (first live)
//!   Inactive ─────────────────────────────────→ Active
//!      ↑                                          │
//!      └──── remove_connection / prune (last) ────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use typeroom_protocol::{
    ConnectionId, RoomMember, RoomId, RoomRecord, RoomSubscriber,
    SubscriberGameStatus, SubscriberStatus, UserId,
};

use crate::PresenceError;

/// Result of a status read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStatus {
    /// Live connections after pruning.
    pub live_connections: usize,
    pub status: SubscriberStatus,
    /// `true` if the read itself had to correct a stale status.
    pub transitioned: bool,
}

/// Snapshot of a room's subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSnapshot {
    pub subscribers: Vec<RoomSubscriber>,
    /// Subscribers whose status was corrected to inactive while taking
    /// the snapshot.
    pub went_inactive: Vec<UserId>,
}

#[derive(Debug)]
struct Subscriber {
    username: String,
    status: SubscriberStatus,
    game_status: SubscriberGameStatus,
    /// Live connections and when each one expires.
    connections: HashMap<ConnectionId, Instant>,
}

impl Subscriber {
    fn new(username: String) -> Self {
        Self {
            username,
            status: SubscriberStatus::Inactive,
            game_status: SubscriberGameStatus::Unstarted,
            connections: HashMap::new(),
        }
    }

    /// Drops expired connections and makes the status agree with what
    /// is left. Returns `true` if the status changed.
    fn reconcile(&mut self, now: Instant) -> bool {
        self.connections.retain(|_, expires_at| *expires_at > now);
        let wanted = if self.connections.is_empty() {
            SubscriberStatus::Inactive
        } else {
            SubscriberStatus::Active
        };
        let changed = self.status != wanted;
        self.status = wanted;
        changed
    }

    fn snapshot(&self, user_id: UserId) -> RoomSubscriber {
        RoomSubscriber {
            user_id,
            username: self.username.clone(),
            status: self.status,
            game_status: self.game_status,
        }
    }
}

#[derive(Debug)]
struct RoomPresence {
    record: RoomRecord,
    subscribers: HashMap<UserId, Subscriber>,
}

/// Presence for every registered room.
#[derive(Debug)]
pub struct PresenceState {
    rooms: HashMap<RoomId, RoomPresence>,
    connection_ttl: Duration,
}

impl PresenceState {
    pub fn new(connection_ttl: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            connection_ttl,
        }
    }

    // -- membership -------------------------------------------------------

    /// Registers a room and its members, each inactive and unstarted.
    ///
    /// Registering an existing room refreshes its metadata and adds any
    /// new members; existing subscribers keep their presence.
    ///
    /// # Errors
    /// [`PresenceError::AdminNotMember`] if the admin is missing from the
    /// member list.
    pub fn register_room(&mut self, record: RoomRecord) -> Result<(), PresenceError> {
        if !record.has_member(record.admin_id) {
            return Err(PresenceError::AdminNotMember {
                room: record.id,
                admin: record.admin_id,
            });
        }

        let room = self.rooms.entry(record.id).or_insert_with(|| RoomPresence {
            record: record.clone(),
            subscribers: HashMap::new(),
        });
        for member in &record.members {
            room.subscribers
                .entry(member.user_id)
                .or_insert_with(|| Subscriber::new(member.username.clone()));
        }
        let mut members = record.members.clone();
        for existing in &room.record.members {
            if !record.has_member(existing.user_id) {
                members.push(existing.clone());
            }
        }
        room.record = RoomRecord { members, ..record };
        Ok(())
    }

    /// Adds a member to a registered room. Returns `false` if they were
    /// already a member.
    pub fn add_member(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        username: &str,
    ) -> Result<bool, PresenceError> {
        let room = self.room_mut(room_id)?;
        if room.subscribers.contains_key(&user_id) {
            return Ok(false);
        }
        room.subscribers
            .insert(user_id, Subscriber::new(username.to_string()));
        room.record.members.push(RoomMember {
            user_id,
            username: username.to_string(),
        });
        Ok(true)
    }

    /// Removes a subscriber and all their connections. Returns `false`
    /// if they were not a subscriber.
    pub fn remove_subscriber(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<bool, PresenceError> {
        let room = self.room_mut(room_id)?;
        let removed = room.subscribers.remove(&user_id).is_some();
        room.record.members.retain(|m| m.user_id != user_id);
        Ok(removed)
    }

    /// Forgets a room entirely. Returns `false` if it was not registered.
    pub fn delete_room(&mut self, room_id: RoomId) -> bool {
        self.rooms.remove(&room_id).is_some()
    }

    pub fn room(&self, room_id: RoomId) -> Result<&RoomRecord, PresenceError> {
        self.rooms
            .get(&room_id)
            .map(|room| &room.record)
            .ok_or(PresenceError::RoomNotFound(room_id))
    }

    pub fn is_subscriber(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|room| room.subscribers.contains_key(&user_id))
    }

    // -- presence ---------------------------------------------------------

    /// Adds a connection, or refreshes its expiry if already present.
    ///
    /// Returns `true` if this made the subscriber active.
    pub fn add_connection(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Result<bool, PresenceError> {
        let ttl = self.connection_ttl;
        let subscriber = self.subscriber_mut(room_id, user_id)?;
        let was_active = subscriber.status == SubscriberStatus::Active;
        subscriber.connections.insert(connection_id, now + ttl);
        subscriber.reconcile(now);
        Ok(!was_active && subscriber.status == SubscriberStatus::Active)
    }

    /// Removes a connection.
    ///
    /// Returns `true` if the subscriber was active and no live
    /// connection remains.
    pub fn remove_connection(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Result<bool, PresenceError> {
        let subscriber = self.subscriber_mut(room_id, user_id)?;
        let was_active = subscriber.status == SubscriberStatus::Active;
        subscriber.connections.remove(&connection_id);
        subscriber.reconcile(now);
        Ok(was_active && subscriber.status == SubscriberStatus::Inactive)
    }

    /// Reads a subscriber's presence, correcting it if it went stale.
    pub fn status(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        now: Instant,
    ) -> Result<PresenceStatus, PresenceError> {
        let subscriber = self.subscriber_mut(room_id, user_id)?;
        let transitioned = subscriber.reconcile(now);
        Ok(PresenceStatus {
            live_connections: subscriber.connections.len(),
            status: subscriber.status,
            transitioned,
        })
    }

    /// Snapshots every subscriber, pruning and correcting each one.
    ///
    /// Ordered by username, then user id.
    pub fn subscribers(
        &mut self,
        room_id: RoomId,
        now: Instant,
    ) -> Result<SubscriberSnapshot, PresenceError> {
        let room = self.room_mut(room_id)?;
        let mut went_inactive = Vec::new();
        let mut subscribers = Vec::with_capacity(room.subscribers.len());

        for (&user_id, subscriber) in &mut room.subscribers {
            if subscriber.reconcile(now) && subscriber.status == SubscriberStatus::Inactive {
                went_inactive.push(user_id);
            }
            subscribers.push(subscriber.snapshot(user_id));
        }
        subscribers.sort_by(|a, b| {
            a.username
                .cmp(&b.username)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        went_inactive.sort();

        Ok(SubscriberSnapshot {
            subscribers,
            went_inactive,
        })
    }

    // -- game status ------------------------------------------------------

    pub fn game_status(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<SubscriberGameStatus, PresenceError> {
        self.rooms
            .get(&room_id)
            .ok_or(PresenceError::RoomNotFound(room_id))?
            .subscribers
            .get(&user_id)
            .map(|s| s.game_status)
            .ok_or(PresenceError::SubscriberNotFound {
                room: room_id,
                user: user_id,
            })
    }

    pub fn set_game_status(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
        status: SubscriberGameStatus,
    ) -> Result<(), PresenceError> {
        self.subscriber_mut(room_id, user_id)?.game_status = status;
        Ok(())
    }

    /// Puts every subscriber back to `Unstarted` for a fresh game.
    pub fn reset_game_statuses(&mut self, room_id: RoomId) -> Result<(), PresenceError> {
        for subscriber in self.room_mut(room_id)?.subscribers.values_mut() {
            subscriber.game_status = SubscriberGameStatus::Unstarted;
        }
        Ok(())
    }

    // -- helpers ----------------------------------------------------------

    fn room_mut(&mut self, room_id: RoomId) -> Result<&mut RoomPresence, PresenceError> {
        self.rooms
            .get_mut(&room_id)
            .ok_or(PresenceError::RoomNotFound(room_id))
    }

    fn subscriber_mut(
        &mut self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<&mut Subscriber, PresenceError> {
        self.room_mut(room_id)?
            .subscribers
            .get_mut(&user_id)
            .ok_or(PresenceError::SubscriberNotFound {
                room: room_id,
                user: user_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn setup() -> (PresenceState, RoomId, UserId, UserId) {
        let admin = UserId::new();
        let guest = UserId::new();
        let record = RoomRecord::new(admin, "ada", 30).with_member(guest, "bob");
        let room = record.id;
        let mut state = PresenceState::new(TTL);
        state.register_room(record).unwrap();
        (state, room, admin, guest)
    }

    #[test]
    fn test_register_room_seeds_inactive_unstarted_members() {
        let (mut state, room, admin, guest) = setup();
        let snapshot = state.subscribers(room, Instant::now()).unwrap();

        assert_eq!(snapshot.subscribers.len(), 2);
        assert!(snapshot.went_inactive.is_empty());
        for s in &snapshot.subscribers {
            assert_eq!(s.status, SubscriberStatus::Inactive);
            assert_eq!(s.game_status, SubscriberGameStatus::Unstarted);
        }
        assert_eq!(snapshot.subscribers[0].username, "ada");
        assert!(state.is_subscriber(room, admin));
        assert!(state.is_subscriber(room, guest));
    }

    #[test]
    fn test_register_room_rejects_missing_admin() {
        let mut record = RoomRecord::new(UserId::new(), "ada", 30);
        record.members.clear();
        let mut state = PresenceState::new(TTL);
        let err = state.register_room(record).unwrap_err();
        assert!(matches!(err, PresenceError::AdminNotMember { .. }));
    }

    #[test]
    fn test_reregister_keeps_presence_and_adds_members() {
        let (mut state, room, admin, _) = setup();
        let now = Instant::now();
        state.add_connection(room, admin, ConnectionId::new(), now).unwrap();

        let mut record = state.room(room).unwrap().clone();
        let carol = UserId::new();
        record = record.with_member(carol, "carol");
        state.register_room(record).unwrap();

        assert_eq!(state.room(room).unwrap().members.len(), 3);
        let status = state.status(room, admin, now).unwrap();
        assert_eq!(status.status, SubscriberStatus::Active);
    }

    #[test]
    fn test_first_connection_transitions_to_active() {
        let (mut state, room, admin, _) = setup();
        let now = Instant::now();

        assert!(state.add_connection(room, admin, ConnectionId::new(), now).unwrap());
        assert!(!state.add_connection(room, admin, ConnectionId::new(), now).unwrap());

        let status = state.status(room, admin, now).unwrap();
        assert_eq!(status.live_connections, 2);
        assert_eq!(status.status, SubscriberStatus::Active);
        assert!(!status.transitioned);
    }

    #[test]
    fn test_two_connections_leave_in_turn() {
        let (mut state, room, user, _) = setup();
        let now = Instant::now();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();

        state.add_connection(room, user, c1, now).unwrap();
        state.add_connection(room, user, c2, now).unwrap();

        assert!(!state.remove_connection(room, user, c1, now).unwrap());
        assert_eq!(
            state.status(room, user, now).unwrap().status,
            SubscriberStatus::Active
        );

        assert!(state.remove_connection(room, user, c2, now).unwrap());
        // A repeated remove reports nothing new.
        assert!(!state.remove_connection(room, user, c2, now).unwrap());
        assert_eq!(
            state.status(room, user, now).unwrap().status,
            SubscriberStatus::Inactive
        );
    }

    #[test]
    fn test_status_read_corrects_expired_connections() {
        let (mut state, room, user, _) = setup();
        let start = Instant::now();
        state.add_connection(room, user, ConnectionId::new(), start).unwrap();

        let later = start + TTL + Duration::from_secs(1);
        let status = state.status(room, user, later).unwrap();
        assert_eq!(status.live_connections, 0);
        assert_eq!(status.status, SubscriberStatus::Inactive);
        assert!(status.transitioned);

        // Already corrected, so the next read reports no transition.
        assert!(!state.status(room, user, later).unwrap().transitioned);
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let (mut state, room, user, _) = setup();
        let start = Instant::now();
        let conn = ConnectionId::new();
        state.add_connection(room, user, conn, start).unwrap();

        let midway = start + TTL / 2;
        assert!(!state.add_connection(room, user, conn, midway).unwrap());

        let past_first_expiry = start + TTL + Duration::from_secs(1);
        let status = state.status(room, user, past_first_expiry).unwrap();
        assert_eq!(status.status, SubscriberStatus::Active);
        assert_eq!(status.live_connections, 1);
    }

    #[test]
    fn test_remove_after_expiry_does_not_double_report() {
        let (mut state, room, user, _) = setup();
        let start = Instant::now();
        let conn = ConnectionId::new();
        state.add_connection(room, user, conn, start).unwrap();

        let later = start + TTL + Duration::from_secs(1);
        assert!(state.status(room, user, later).unwrap().transitioned);
        assert!(!state.remove_connection(room, user, conn, later).unwrap());
    }

    #[test]
    fn test_snapshot_reports_users_that_went_inactive() {
        let (mut state, room, admin, guest) = setup();
        let start = Instant::now();
        state.add_connection(room, admin, ConnectionId::new(), start).unwrap();
        let later = start + TTL / 2;
        state.add_connection(room, guest, ConnectionId::new(), later).unwrap();

        let snapshot = state
            .subscribers(room, start + TTL + Duration::from_secs(1))
            .unwrap();
        assert_eq!(snapshot.went_inactive, vec![admin]);
        let guest_entry = snapshot
            .subscribers
            .iter()
            .find(|s| s.user_id == guest)
            .unwrap();
        assert_eq!(guest_entry.status, SubscriberStatus::Active);
    }

    #[test]
    fn test_unknown_room_and_subscriber_are_errors() {
        let (mut state, room, _, _) = setup();
        let now = Instant::now();
        let stranger = UserId::new();

        let err = state
            .add_connection(RoomId::new(), stranger, ConnectionId::new(), now)
            .unwrap_err();
        assert!(matches!(err, PresenceError::RoomNotFound(_)));

        let err = state
            .add_connection(room, stranger, ConnectionId::new(), now)
            .unwrap_err();
        assert!(matches!(err, PresenceError::SubscriberNotFound { .. }));
    }

    #[test]
    fn test_game_status_set_and_reset() {
        let (mut state, room, admin, guest) = setup();
        state
            .set_game_status(room, admin, SubscriberGameStatus::Started)
            .unwrap();
        state
            .set_game_status(room, guest, SubscriberGameStatus::Finished)
            .unwrap();
        assert_eq!(
            state.game_status(room, guest).unwrap(),
            SubscriberGameStatus::Finished
        );

        state.reset_game_statuses(room).unwrap();
        assert_eq!(
            state.game_status(room, admin).unwrap(),
            SubscriberGameStatus::Unstarted
        );
        assert_eq!(
            state.game_status(room, guest).unwrap(),
            SubscriberGameStatus::Unstarted
        );
    }

    #[test]
    fn test_member_add_remove_and_room_delete() {
        let (mut state, room, _, guest) = setup();
        let carol = UserId::new();

        assert!(state.add_member(room, carol, "carol").unwrap());
        assert!(!state.add_member(room, carol, "carol").unwrap());
        assert!(state.remove_subscriber(room, guest).unwrap());
        assert!(!state.is_subscriber(room, guest));
        assert!(!state.room(room).unwrap().has_member(guest));

        assert!(state.delete_room(room));
        assert!(!state.delete_room(room));
        assert!(matches!(state.room(room), Err(PresenceError::RoomNotFound(_))));
    }
}
