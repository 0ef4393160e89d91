use typeroom_protocol::{EntryId, ProtocolError, RoomId};

/// Errors that can occur in the stream layer.
///
/// Any of these ends the subscription that produced it. The stream never
/// retries on its own; callers resubscribe with a fresh cursor if they
/// want to keep reading.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The backing store could not be reached or rejected the request.
    #[error("stream backend error: {0}")]
    Backend(String),

    /// An entry exists but its payload does not decode.
    #[error("malformed entry {id}: {reason}")]
    Malformed { id: EntryId, reason: String },

    /// The room's stream was deleted while it was being read.
    #[error("stream for room {0} was deleted")]
    Deleted(RoomId),

    /// Encoding a message before appending it failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
