//! Change events as read from a shard of the CDC stream
//!
//! The schema (event name, key, new image) is dictated by the upstream feed.
//! Events are never mutated after they have been read; the processor only
//! borrows them while applying.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attribute map of a single table record.
pub type Item = serde_json::Map<String, serde_json::Value>;

/// Kind of change captured by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// A new record was written
    Insert,
    /// An existing record was overwritten
    Modify,
    /// A record was deleted
    Remove,
    /// Any event name this crate does not understand
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Event name as it appears on the stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse an event name, mapping anything unrecognised to `Unknown`.
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "INSERT" => Self::Insert,
            "MODIFY" => Self::Modify,
            "REMOVE" => Self::Remove,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one shard of the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Position of an event within its shard.
///
/// Stream sequence numbers are decimal strings of up to 39 digits, so they
/// are kept as `u128` and serialized back as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SequenceNumber(u128);

impl SequenceNumber {
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u128 {
        self.0
    }

    /// The sequence number directly after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SequenceNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Self)
    }
}

impl TryFrom<String> for SequenceNumber {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SequenceNumber> for String {
    fn from(seq: SequenceNumber) -> Self {
        seq.to_string()
    }
}

impl From<u128> for SequenceNumber {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// A single captured change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened to the record
    #[serde(rename = "eventName")]
    pub kind: EventKind,
    /// Partition key value of the affected record
    pub key: String,
    /// Full record after the change (INSERT/MODIFY only)
    #[serde(default, rename = "newImage", skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Item>,
    /// Shard this event was read from
    #[serde(rename = "shardId")]
    pub shard_id: ShardId,
    /// Position of the event within the shard
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: SequenceNumber,
}

impl ChangeEvent {
    /// Create an INSERT event.
    pub fn insert(
        shard_id: impl Into<ShardId>,
        sequence_number: impl Into<SequenceNumber>,
        key: impl Into<String>,
        new_image: Item,
    ) -> Self {
        Self::with_image(EventKind::Insert, shard_id, sequence_number, key, new_image)
    }

    /// Create a MODIFY event.
    pub fn modify(
        shard_id: impl Into<ShardId>,
        sequence_number: impl Into<SequenceNumber>,
        key: impl Into<String>,
        new_image: Item,
    ) -> Self {
        Self::with_image(EventKind::Modify, shard_id, sequence_number, key, new_image)
    }

    /// Create a REMOVE event.
    pub fn remove(
        shard_id: impl Into<ShardId>,
        sequence_number: impl Into<SequenceNumber>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Remove,
            key: key.into(),
            new_image: None,
            shard_id: shard_id.into(),
            sequence_number: sequence_number.into(),
        }
    }

    fn with_image(
        kind: EventKind,
        shard_id: impl Into<ShardId>,
        sequence_number: impl Into<SequenceNumber>,
        key: impl Into<String>,
        new_image: Item,
    ) -> Self {
        Self {
            kind,
            key: key.into(),
            new_image: Some(new_image),
            shard_id: shard_id.into(),
            sequence_number: sequence_number.into(),
        }
    }

    /// Whether the event carries a full record image to upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(self.kind, EventKind::Insert | EventKind::Modify)
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} key={} shard={} seq={}",
            self.kind, self.key, self.shard_id, self.sequence_number
        )
    }
}
