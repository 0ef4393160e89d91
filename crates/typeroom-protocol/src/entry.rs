//! Stream entry identifiers and read cursors.
//!
//! Every entry appended to a room's stream gets an [`EntryId`]: a
//! `(millis, seq)` pair that is strictly increasing within one stream.
//! Clients remember the id of the last entry they saw and hand it back
//! when they reconnect, so the id doubles as a resumable cursor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

/// Identifier of one entry in a room stream.
///
/// Ordered first by the millisecond timestamp of the append, then by the
/// per-millisecond sequence number. Displayed as `"<millis>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    /// The smallest possible id. Reading after `ZERO` replays the whole
    /// stream.
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    /// Creates an id from its parts.
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Returns the millisecond component.
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Returns the sequence component.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Computes the id that follows `self` for an append at `now_millis`.
    ///
    /// If the clock moved forward the sequence restarts at zero; if it
    /// stalled or went backwards the previous timestamp is kept and the
    /// sequence is bumped, so ids never repeat or decrease.
    pub fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = ProtocolError;

    /// Parses `"<millis>-<seq>"`. A bare `"<millis>"` is accepted and
    /// means sequence 0, so a client may resume from a timestamp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        let millis = millis.parse().map_err(|_| invalid())?;
        let seq = seq.parse().map_err(|_| invalid())?;
        Ok(Self::new(millis, seq))
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Only entries appended after the subscription starts.
    Latest,
    /// Every entry strictly after the given id.
    After(EntryId),
}

impl Cursor {
    /// Builds a cursor from an optional last-seen id (`None` on first
    /// attach).
    pub fn from_last_seen(last_seen: Option<EntryId>) -> Self {
        match last_seen {
            Some(id) => Self::After(id),
            None => Self::Latest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_restarts_sequence_when_clock_advances() {
        let id = EntryId::new(100, 7);
        assert_eq!(id.successor(101), EntryId::new(101, 0));
    }

    #[test]
    fn test_successor_bumps_sequence_within_same_millisecond() {
        let id = EntryId::new(100, 7);
        assert_eq!(id.successor(100), EntryId::new(100, 8));
    }

    #[test]
    fn test_successor_never_goes_backwards_when_clock_does() {
        let id = EntryId::new(100, 7);
        let next = id.successor(50);
        assert!(next > id);
        assert_eq!(next, EntryId::new(100, 8));
    }

    #[test]
    fn test_ordering_is_millis_then_seq() {
        assert!(EntryId::new(1, 9) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 0) < EntryId::new(2, 1));
        assert!(EntryId::ZERO < EntryId::new(0, 1));
    }

    #[test]
    fn test_display_and_parse() {
        let id = EntryId::new(1700000000000, 3);
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("1700000000000-3".parse::<EntryId>().unwrap(), id);
    }

    #[test]
    fn test_parse_bare_timestamp_means_seq_zero() {
        let id: EntryId = "42".parse().unwrap();
        assert_eq!(id, EntryId::new(42, 0));
    }

    #[test]
    fn test_parse_garbage_is_rejected() {
        assert!(matches!(
            "abc-1".parse::<EntryId>(),
            Err(ProtocolError::InvalidEntryId(_))
        ));
        assert!("1-x".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_serializes_as_string() {
        let json = serde_json::to_string(&EntryId::new(5, 1)).unwrap();
        assert_eq!(json, r#""5-1""#);
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntryId::new(5, 1));
    }

    #[test]
    fn test_cursor_from_last_seen() {
        assert_eq!(Cursor::from_last_seen(None), Cursor::Latest);
        let id = EntryId::new(3, 0);
        assert_eq!(Cursor::from_last_seen(Some(id)), Cursor::After(id));
    }
}
