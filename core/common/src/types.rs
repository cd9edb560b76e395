//! Common types used throughout offsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Local sequence number assigned to a change record at enqueue time.
///
/// Sequence numbers start at 1. `SequenceNumber::ZERO` is the high-water mark
/// of a queue that has never had anything acknowledged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Nothing assigned / nothing acknowledged.
    pub const ZERO: Self = Self(0);

    /// First sequence number handed out by an empty queue.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The sequence number following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The sequence number preceding this one, saturating at zero.
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of the remote collection/document the engine mirrors into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// Create a new TargetId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "TargetId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reachability of the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

impl From<bool> for ConnectivityState {
    fn from(reachable: bool) -> Self {
        if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

/// A buffered change waiting to be delivered to the remote.
///
/// The payload is opaque to the engine. `id` is stable across retries so the
/// remote can apply a replayed record idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the local queue.
    pub sequence: SequenceNumber,
    /// Idempotency key for replay.
    pub id: Uuid,
    /// Application payload.
    pub payload: serde_json::Value,
    /// When the change was captured locally.
    pub enqueued_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Create a record for the given sequence number with a fresh id.
    pub fn new(sequence: SequenceNumber, payload: serde_json::Value) -> Self {
        Self {
            sequence,
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_target_id_creation() {
        let id = TargetId::new("attendance").unwrap();
        assert_eq!(id.as_str(), "attendance");
    }

    #[test]
    fn test_target_id_empty_fails() {
        assert!(TargetId::new("").is_err());
        assert!(TargetId::new("   ").is_err());
    }

    #[test]
    fn test_connectivity_from_bool() {
        assert_eq!(ConnectivityState::from(true), ConnectivityState::Online);
        assert_eq!(ConnectivityState::from(false), ConnectivityState::Offline);
        assert_eq!(ConnectivityState::Offline.to_string(), "offline");
    }

    #[test]
    fn test_change_record_ids_are_unique() {
        let a = ChangeRecord::new(SequenceNumber::FIRST, serde_json::json!({"n": 1}));
        let b = ChangeRecord::new(SequenceNumber::FIRST, serde_json::json!({"n": 1}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_sequence_serializes_as_number() {
        let json = serde_json::to_string(&SequenceNumber::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    proptest! {
        #[test]
        fn sequence_next_is_strictly_greater(n in 0u64..u64::MAX) {
            let seq = SequenceNumber::new(n);
            prop_assert!(seq.next() > seq);
            prop_assert_eq!(seq.next().prev(), seq);
        }
    }
}
