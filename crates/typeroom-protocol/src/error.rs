//! Error types for the protocol layer.
//!
//! Each crate in Typeroom defines its own error enum. When you see a
//! `ProtocolError`, the problem is in serialization or in a malformed
//! value, not in networking or room state.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, an
    /// unknown `type` tag.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A stream entry id string was not of the form `<millis>-<seq>`.
    #[error("invalid entry id: {0:?}")]
    InvalidEntryId(String),
}
