//! Storage backend for room streams.
//!
//! A [`StreamStore`] is an append-only log per room with blocking reads,
//! the same shape as a Redis stream read with `XADD`/`XREAD BLOCK`.
//! [`MemoryStreamStore`] keeps everything in process.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use typeroom_protocol::{EntryId, RoomId};

use crate::StreamError;

/// Which of the two entry families an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A control signal for the server's own consumers.
    Action,
    /// A message fanned out to clients.
    Push,
}

/// One stored entry, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub payload: Arc<[u8]>,
}

/// Backend for per-room append-only logs.
pub trait StreamStore: Send + Sync + 'static {
    /// Appends an entry and returns its id. Never waits on readers.
    fn append(
        &self,
        room: RoomId,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<EntryId, StreamError>> + Send;

    /// Returns the entries strictly after `after`, in append order.
    ///
    /// If there are none, waits up to `block` for one to arrive and
    /// returns an empty batch on timeout.
    fn read_after(
        &self,
        room: RoomId,
        after: EntryId,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<RawEntry>, StreamError>> + Send;

    /// Returns the id of the newest entry, or [`EntryId::ZERO`] for an
    /// empty stream.
    fn last_id(
        &self,
        room: RoomId,
    ) -> impl Future<Output = Result<EntryId, StreamError>> + Send;

    /// Deletes the room's whole stream. Returns `false` if there was
    /// nothing to delete.
    ///
    /// A deleted room stays deleted: later reads and appends fail with
    /// [`StreamError::Deleted`].
    fn delete(
        &self,
        room: RoomId,
    ) -> impl Future<Output = Result<bool, StreamError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryStreamStore
// ---------------------------------------------------------------------------

struct RoomLog {
    entries: Vec<RawEntry>,
    last_id: EntryId,
    /// Bumped on every append. Dropping it wakes blocked readers with an
    /// error, which is how deletion reaches them.
    appended: watch::Sender<EntryId>,
}

impl RoomLog {
    fn new() -> Self {
        let (appended, _) = watch::channel(EntryId::ZERO);
        Self {
            entries: Vec::new(),
            last_id: EntryId::ZERO,
            appended,
        }
    }

    fn after(&self, after: EntryId) -> Vec<RawEntry> {
        let start = self.entries.partition_point(|e| e.id <= after);
        self.entries[start..].to_vec()
    }
}

/// In-process [`StreamStore`].
///
/// A stream is created by its first append and lives until
/// [`StreamStore::delete`]. Reads never create a stream. Deleted rooms
/// are remembered so that late readers end instead of waiting on a log
/// that will never come back, and late writers cannot recreate it.
pub struct MemoryStreamStore {
    rooms: Mutex<Rooms>,
    /// Bumped whenever a stream is created or deleted. Readers of a room
    /// without a stream wait on this.
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct Rooms {
    logs: HashMap<RoomId, RoomLog>,
    deleted: HashSet<RoomId>,
}

enum Wake {
    Appended(watch::Receiver<EntryId>),
    Changed(watch::Receiver<u64>),
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            rooms: Mutex::new(Rooms::default()),
            changed,
        }
    }

    /// Number of entries currently stored for `room`.
    pub async fn len(&self, room: RoomId) -> usize {
        self.rooms
            .lock()
            .await
            .logs
            .get(&room)
            .map_or(0, |log| log.entries.len())
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

impl StreamStore for MemoryStreamStore {
    async fn append(
        &self,
        room: RoomId,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> Result<EntryId, StreamError> {
        let mut rooms = self.rooms.lock().await;
        if rooms.deleted.contains(&room) {
            return Err(StreamError::Deleted(room));
        }
        let created = !rooms.logs.contains_key(&room);
        let log = rooms.logs.entry(room).or_insert_with(RoomLog::new);

        let id = log.last_id.successor(now_millis());
        log.entries.push(RawEntry {
            id,
            kind,
            payload: payload.into(),
        });
        log.last_id = id;
        log.appended.send_replace(id);
        if created {
            self.bump();
        }
        Ok(id)
    }

    async fn read_after(
        &self,
        room: RoomId,
        after: EntryId,
        block: Duration,
    ) -> Result<Vec<RawEntry>, StreamError> {
        // Subscribe while holding the lock so an append or delete landing
        // between the check and the wait still wakes us.
        let wake = {
            let rooms = self.rooms.lock().await;
            if rooms.deleted.contains(&room) {
                return Err(StreamError::Deleted(room));
            }
            match rooms.logs.get(&room) {
                Some(log) => {
                    let ready = log.after(after);
                    if !ready.is_empty() {
                        return Ok(ready);
                    }
                    Wake::Appended(log.appended.subscribe())
                }
                None => Wake::Changed(self.changed.subscribe()),
            }
        };

        let woke = match wake {
            Wake::Appended(mut rx) => tokio::time::timeout(block, rx.changed()).await,
            Wake::Changed(mut rx) => tokio::time::timeout(block, rx.changed()).await,
        };
        match woke {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Err(_)) => Err(StreamError::Deleted(room)),
            Ok(Ok(())) => {
                let rooms = self.rooms.lock().await;
                if rooms.deleted.contains(&room) {
                    return Err(StreamError::Deleted(room));
                }
                // Another room may have been created; that is an empty batch.
                Ok(rooms
                    .logs
                    .get(&room)
                    .map_or_else(Vec::new, |log| log.after(after)))
            }
        }
    }

    async fn last_id(&self, room: RoomId) -> Result<EntryId, StreamError> {
        Ok(self
            .rooms
            .lock()
            .await
            .logs
            .get(&room)
            .map_or(EntryId::ZERO, |log| log.last_id))
    }

    async fn delete(&self, room: RoomId) -> Result<bool, StreamError> {
        let mut rooms = self.rooms.lock().await;
        let existed = rooms.logs.remove(&room).is_some();
        rooms.deleted.insert(room);
        self.bump();
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_append_ids_strictly_increase() {
        let store = MemoryStreamStore::new();
        let room = RoomId::new();

        let mut prev = EntryId::ZERO;
        for i in 0..20u8 {
            let id = store.append(room, EntryKind::Push, vec![i]).await.unwrap();
            assert!(id > prev, "{id} should be after {prev}");
            prev = id;
        }
        assert_eq!(store.last_id(room).await.unwrap(), prev);
        assert_eq!(store.len(room).await, 20);
    }

    #[tokio::test]
    async fn test_read_after_returns_suffix() {
        let store = MemoryStreamStore::new();
        let room = RoomId::new();

        let first = store.append(room, EntryKind::Push, b"a".to_vec()).await.unwrap();
        store.append(room, EntryKind::Action, b"b".to_vec()).await.unwrap();
        store.append(room, EntryKind::Push, b"c".to_vec()).await.unwrap();

        let batch = store.read_after(room, first, BLOCK).await.unwrap();
        let payloads: Vec<&[u8]> = batch.iter().map(|e| &*e.payload).collect();
        assert_eq!(payloads, vec![&b"b"[..], &b"c"[..]]);
        assert_eq!(batch[0].kind, EntryKind::Action);
    }

    #[tokio::test]
    async fn test_streams_are_isolated_per_room() {
        let store = MemoryStreamStore::new();
        let a = RoomId::new();
        let b = RoomId::new();
        store.append(a, EntryKind::Push, b"x".to_vec()).await.unwrap();

        assert_eq!(store.last_id(b).await.unwrap(), EntryId::ZERO);
        let batch = store.read_after(b, EntryId::ZERO, BLOCK).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_times_out_with_empty_batch() {
        let store = MemoryStreamStore::new();
        let batch = store
            .read_after(RoomId::new(), EntryId::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let store = Arc::new(MemoryStreamStore::new());
        let room = RoomId::new();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.read_after(room, EntryId::ZERO, Duration::from_secs(30)).await
            })
        };
        tokio::task::yield_now().await;

        store.append(room, EntryKind::Push, b"hi".to_vec()).await.unwrap();
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&*batch[0].payload, b"hi");
    }

    #[tokio::test]
    async fn test_delete_wakes_blocked_reader_with_deleted() {
        let store = Arc::new(MemoryStreamStore::new());
        let room = RoomId::new();
        let last = store.append(room, EntryKind::Push, b"x".to_vec()).await.unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.read_after(room, last, Duration::from_secs(30)).await
            })
        };
        tokio::task::yield_now().await;

        assert!(store.delete(room).await.unwrap());
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(StreamError::Deleted(r)) if r == room));
        assert!(!store.delete(room).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_does_not_create_a_stream() {
        let store = MemoryStreamStore::new();
        let room = RoomId::new();

        let batch = store.read_after(room, EntryId::ZERO, BLOCK).await.unwrap();
        assert!(batch.is_empty());
        assert!(!store.delete(room).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_room_stays_deleted() {
        let store = MemoryStreamStore::new();
        let room = RoomId::new();
        let first = store.append(room, EntryKind::Push, b"a".to_vec()).await.unwrap();
        assert!(store.delete(room).await.unwrap());

        let read = store.read_after(room, first, BLOCK).await;
        assert!(matches!(read, Err(StreamError::Deleted(r)) if r == room));
        let write = store.append(room, EntryKind::Push, b"b".to_vec()).await;
        assert!(matches!(write, Err(StreamError::Deleted(r)) if r == room));
        assert!(!store.delete(room).await.unwrap());
        assert_eq!(store.len(room).await, 0);
    }

    #[tokio::test]
    async fn test_delete_wakes_reader_of_room_without_stream() {
        let store = Arc::new(MemoryStreamStore::new());
        let room = RoomId::new();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.read_after(room, EntryId::ZERO, Duration::from_secs(30)).await
            })
        };
        tokio::task::yield_now().await;

        assert!(!store.delete(room).await.unwrap());
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(StreamError::Deleted(r)) if r == room));
    }
}
