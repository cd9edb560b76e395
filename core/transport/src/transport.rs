//! Remote transport trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use offsync_common::{ChangeRecord, Result, SequenceNumber, TargetId};

/// One outbound sync attempt.
///
/// A batch always carries the complete undelivered snapshot in enqueue
/// order. The remote is a full-state mirror, so a batch is never an
/// incremental diff against a previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Fresh for every attempt; sent as the request idempotency key.
    pub batch_id: Uuid,
    /// Remote collection the records belong to.
    pub target: TargetId,
    /// Hex digest of the logical state this batch represents.
    pub fingerprint: String,
    /// Undelivered records, lowest sequence first.
    pub records: Vec<ChangeRecord>,
}

impl Batch {
    /// Create a batch for the given snapshot.
    pub fn new(target: TargetId, fingerprint: impl Into<String>, records: Vec<ChangeRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            target,
            fingerprint: fingerprint.into(),
            records,
        }
    }

    /// Highest sequence number contained in the batch.
    pub fn high_water(&self) -> SequenceNumber {
        self.records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(SequenceNumber::ZERO)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Transport trait for shipping batches to the system of record.
///
/// Implementations report failures through the common error type:
/// - `Error::Transport` / `Error::Timeout` for network trouble
/// - `Error::Rejected` when the remote refused the batch
///
/// The engine bounds every call with its own timeout, so implementations may
/// block for as long as the underlying client does.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Deliver a batch.
    ///
    /// # Postconditions
    /// - On `Ok`, every record in the batch is applied at the remote
    /// - Applying a record whose id was already applied has no further effect
    async fn send(&self, batch: &Batch) -> Result<()>;

    /// Check whether the remote is reachable right now.
    ///
    /// Used by the connectivity monitor's probe loop. Transports without a
    /// cheap health check report reachable and rely on send failures.
    async fn probe(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord::new(SequenceNumber::new(seq), json!({ "seq": seq }))
    }

    #[test]
    fn test_batch_high_water() {
        let target = TargetId::new("ledger").unwrap();
        let batch = Batch::new(target, "00", vec![record(3), record(4), record(5)]);
        assert_eq!(batch.high_water(), SequenceNumber::new(5));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_empty_batch_high_water_is_zero() {
        let target = TargetId::new("ledger").unwrap();
        let batch = Batch::new(target, "00", Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.high_water(), SequenceNumber::ZERO);
    }

    #[test]
    fn test_batch_ids_differ_per_attempt() {
        let target = TargetId::new("ledger").unwrap();
        let a = Batch::new(target.clone(), "00", vec![record(1)]);
        let b = Batch::new(target, "00", a.records.clone());
        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.records, b.records);
    }
}
