//! Typed publish/subscribe over a [`StreamStore`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use typeroom_protocol::{
    Codec, Cursor, EntryId, JsonCodec, PushMessage, RoomId, StreamAction,
};

use crate::store::{EntryKind, RawEntry, StreamStore};
use crate::subscription::{Decoded, Subscription};
use crate::{StreamConfig, StreamError};

/// Publishes and subscribes to per-room streams.
///
/// Cheap to clone; clones share the store and the shutdown token.
pub struct StreamTransport<S> {
    store: Arc<S>,
    config: StreamConfig,
    codec: JsonCodec,
    shutdown: CancellationToken,
}

impl<S> Clone for StreamTransport<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            codec: self.codec,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: StreamStore> StreamTransport<S> {
    pub fn new(store: S, config: StreamConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Builds a transport over a store that is also used elsewhere.
    pub fn from_shared(store: Arc<S>, config: StreamConfig) -> Self {
        Self {
            store,
            config,
            codec: JsonCodec,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Appends a push message for every connection in the room.
    pub async fn publish_push_message(
        &self,
        room: RoomId,
        message: &PushMessage,
    ) -> Result<EntryId, StreamError> {
        let payload = self.codec.encode(message)?;
        let id = self.store.append(room, EntryKind::Push, payload).await?;
        tracing::debug!(%room, %id, kind = message.kind(), "published push message");
        Ok(id)
    }

    /// Appends a control action.
    pub async fn publish_action(
        &self,
        room: RoomId,
        action: StreamAction,
    ) -> Result<EntryId, StreamError> {
        let payload = self.codec.encode(&action)?;
        let id = self.store.append(room, EntryKind::Action, payload).await?;
        tracing::debug!(%room, %id, ?action, "published action");
        Ok(id)
    }

    /// Id of the newest entry in the room's stream.
    ///
    /// Subscribing with `Cursor::After(last_id)` later picks up exactly
    /// what was appended after this call.
    pub async fn last_id(&self, room: RoomId) -> Result<EntryId, StreamError> {
        self.store.last_id(room).await
    }

    /// Deletes the room's stream. Readers still attached end quietly.
    pub async fn delete(&self, room: RoomId) -> Result<bool, StreamError> {
        let deleted = self.store.delete(room).await?;
        if deleted {
            tracing::debug!(%room, "stream deleted");
        }
        Ok(deleted)
    }

    /// Subscribes with a custom decode function.
    ///
    /// `Cursor::Latest` is pinned to the current last id before this
    /// returns, so anything published afterwards is delivered.
    pub async fn subscribe<T, F>(
        &self,
        room: RoomId,
        cursor: Cursor,
        decode: F,
    ) -> Result<Subscription<T>, StreamError>
    where
        T: Send + 'static,
        F: Fn(&RawEntry) -> Decoded<T> + Send + 'static,
    {
        let start = match cursor {
            Cursor::Latest => self.store.last_id(room).await?,
            Cursor::After(id) => id,
        };
        Ok(Subscription::spawn(
            Arc::clone(&self.store),
            room,
            start,
            self.config.poll_interval,
            self.config.channel_capacity,
            self.shutdown.child_token(),
            decode,
        ))
    }

    /// Subscribes to the push messages of a room.
    ///
    /// Actions are skipped, except `terminate`, which ends the
    /// subscription.
    pub async fn subscribe_push_messages(
        &self,
        room: RoomId,
        cursor: Cursor,
    ) -> Result<Subscription<PushMessage>, StreamError> {
        let codec = self.codec;
        self.subscribe(room, cursor, move |entry| match entry.kind {
            EntryKind::Push => decode_entry(&codec, entry),
            EntryKind::Action => match decode_entry::<StreamAction>(&codec, entry) {
                Decoded::Keep(StreamAction::Terminate) => Decoded::Terminate,
                Decoded::Keep(_) => Decoded::Skip,
                other => other.map_never(),
            },
        })
        .await
    }

    /// Subscribes to the actions of a room. Push messages are skipped and
    /// `terminate` ends the subscription.
    pub async fn subscribe_actions(
        &self,
        room: RoomId,
        cursor: Cursor,
    ) -> Result<Subscription<StreamAction>, StreamError> {
        let codec = self.codec;
        self.subscribe(room, cursor, move |entry| match entry.kind {
            EntryKind::Push => Decoded::Skip,
            EntryKind::Action => match decode_entry(&codec, entry) {
                Decoded::Keep(StreamAction::Terminate) => Decoded::Terminate,
                other => other,
            },
        })
        .await
    }

    /// Cancels every subscription created through this transport or its
    /// clones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn decode_entry<T: serde::de::DeserializeOwned>(
    codec: &JsonCodec,
    entry: &RawEntry,
) -> Decoded<T> {
    match codec.decode(&entry.payload) {
        Ok(item) => Decoded::Keep(item),
        Err(e) => Decoded::Error(StreamError::Malformed {
            id: entry.id,
            reason: e.to_string(),
        }),
    }
}

impl<T> Decoded<T> {
    /// Re-types a non-`Keep` result. `Keep` becomes `Skip`.
    fn map_never<U>(self) -> Decoded<U> {
        match self {
            Decoded::Keep(_) | Decoded::Skip => Decoded::Skip,
            Decoded::Terminate => Decoded::Terminate,
            Decoded::Error(e) => Decoded::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStreamStore;
    use typeroom_protocol::UserId;

    fn transport() -> StreamTransport<MemoryStreamStore> {
        StreamTransport::new(MemoryStreamStore::new(), StreamConfig::default())
    }

    #[tokio::test]
    async fn test_latest_cursor_skips_history() {
        let stream = transport();
        let room = RoomId::new();
        stream
            .publish_push_message(room, &PushMessage::UserJoined(UserId::new()))
            .await
            .unwrap();

        let mut sub = stream.subscribe_push_messages(room, Cursor::Latest).await.unwrap();
        let user = UserId::new();
        let id = stream
            .publish_push_message(room, &PushMessage::UserLeft(user))
            .await
            .unwrap();

        let delivered = sub.next().await.unwrap().unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(delivered.item, PushMessage::UserLeft(user));
    }

    #[tokio::test]
    async fn test_push_subscription_skips_non_terminate_actions() {
        let stream = transport();
        let room = RoomId::new();
        let mut sub = stream.subscribe_push_messages(room, Cursor::Latest).await.unwrap();

        stream
            .publish_action(room, StreamAction::ScoreSubmitted { user_id: UserId::new() })
            .await
            .unwrap();
        stream
            .publish_push_message(room, &PushMessage::CountdownStart { duration_secs: 5 })
            .await
            .unwrap();

        let delivered = sub.next().await.unwrap().unwrap();
        assert_eq!(delivered.item, PushMessage::CountdownStart { duration_secs: 5 });
    }

    #[tokio::test]
    async fn test_action_subscription_skips_push_messages() {
        let stream = transport();
        let room = RoomId::new();
        let mut sub = stream.subscribe_actions(room, Cursor::Latest).await.unwrap();

        let user = UserId::new();
        stream
            .publish_push_message(room, &PushMessage::UserFinishedGame(user))
            .await
            .unwrap();
        stream
            .publish_action(room, StreamAction::ScoreSubmitted { user_id: user })
            .await
            .unwrap();

        let delivered = sub.next().await.unwrap().unwrap();
        assert_eq!(delivered.item, StreamAction::ScoreSubmitted { user_id: user });
    }

    #[tokio::test]
    async fn test_malformed_entry_is_reported_once() {
        let stream = transport();
        let room = RoomId::new();
        let mut sub = stream.subscribe_push_messages(room, Cursor::Latest).await.unwrap();

        let bad = stream
            .store()
            .append(room, EntryKind::Push, b"not json".to_vec())
            .await
            .unwrap();
        stream
            .publish_push_message(room, &PushMessage::UserJoined(UserId::new()))
            .await
            .unwrap();

        match sub.next().await {
            Some(Err(StreamError::Malformed { id, .. })) => assert_eq!(id, bad),
            other => panic!("expected malformed error, got {other:?}"),
        }
        assert!(sub.next().await.is_none(), "subscription ends after the error");
    }

    #[tokio::test]
    async fn test_shutdown_ends_every_subscription() {
        let stream = transport();
        let mut a = stream.subscribe_push_messages(RoomId::new(), Cursor::Latest).await.unwrap();
        let mut b = stream.clone().subscribe_actions(RoomId::new(), Cursor::Latest).await.unwrap();

        stream.shutdown();
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }
}
