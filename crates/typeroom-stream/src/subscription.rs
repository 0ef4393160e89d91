//! Typed, cancellable readers over a room stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use typeroom_protocol::{EntryId, RoomId};

use crate::store::{RawEntry, StreamStore};
use crate::StreamError;

/// What a decode function makes of one raw entry.
#[derive(Debug)]
pub enum Decoded<T> {
    /// Deliver this item to the subscriber.
    Keep(T),
    /// Not for this subscriber; move on.
    Skip,
    /// Stop reading. The subscription ends cleanly.
    Terminate,
    /// The entry is unusable. Delivered once, then the subscription ends.
    Error(StreamError),
}

/// A decoded item together with the id of the entry it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered<T> {
    pub id: EntryId,
    pub item: T,
}

/// A live read of one room's stream.
///
/// A background task reads the stream from the starting cursor, runs
/// each entry through the decode function, and hands kept items over a
/// bounded channel. [`Subscription::next`] returns `None` once the task
/// stops: on cancellation, a terminate entry, stream deletion, or after
/// delivering an error.
///
/// Dropping the subscription cancels the reader.
pub struct Subscription<T> {
    room: RoomId,
    items: mpsc::Receiver<Result<Delivered<T>, StreamError>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Subscription<T> {
    pub(crate) fn spawn<S, F>(
        store: Arc<S>,
        room: RoomId,
        start: EntryId,
        poll_interval: Duration,
        capacity: usize,
        cancel: CancellationToken,
        decode: F,
    ) -> Self
    where
        S: StreamStore,
        F: Fn(&RawEntry) -> Decoded<T> + Send + 'static,
    {
        let (tx, items) = mpsc::channel(capacity.max(1));
        tokio::spawn(read_loop(
            store,
            room,
            start,
            poll_interval,
            cancel.clone(),
            tx,
            decode,
        ));
        Self {
            room,
            items,
            cancel,
        }
    }
}

impl<T> Subscription<T> {
    /// Waits for the next item. `None` means the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<Delivered<T>, StreamError>> {
        self.items.recv().await
    }

    /// Stops the reader. Items already buffered can still be drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn room(&self) -> RoomId {
        self.room
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<S, T, F>(
    store: Arc<S>,
    room: RoomId,
    mut cursor: EntryId,
    poll_interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Delivered<T>, StreamError>>,
    decode: F,
) where
    S: StreamStore,
    F: Fn(&RawEntry) -> Decoded<T>,
{
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(%room, "stream subscription cancelled");
                return;
            }
            batch = store.read_after(room, cursor, poll_interval) => batch,
        };

        let entries = match batch {
            Ok(entries) => entries,
            Err(StreamError::Deleted(_)) => {
                tracing::debug!(%room, "stream deleted, subscription ends");
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        // An empty batch is a poll tick; loop to observe cancellation.
        for entry in entries {
            cursor = entry.id;
            match decode(&entry) {
                Decoded::Keep(item) => {
                    let delivered = Delivered { id: entry.id, item };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(Ok(delivered)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Decoded::Skip => {}
                Decoded::Terminate => {
                    tracing::debug!(%room, id = %entry.id, "terminate entry, subscription ends");
                    return;
                }
                Decoded::Error(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}
