//! In-memory transport for testing and local development.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::transport::{Batch, RemoteTransport};
use offsync_common::{ChangeRecord, Error, Result};

/// Failure injected into the next `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Simulate a dropped connection.
    Network,
    /// Simulate the remote refusing the batch.
    Rejected,
}

impl FailureKind {
    fn into_error(self) -> Error {
        match self {
            FailureKind::Network => Error::Transport("connection reset by peer".to_string()),
            FailureKind::Rejected => Error::Rejected("remote validation failed".to_string()),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Applied records keyed by idempotency key.
    applied: HashMap<Uuid, ChangeRecord>,
    /// Application order of first-seen records.
    order: Vec<Uuid>,
    /// Every batch that was accepted.
    accepted: Vec<Batch>,
    /// Failures to return on upcoming calls.
    scripted: VecDeque<FailureKind>,
}

/// In-memory remote mirror.
///
/// Records are applied idempotently by id, so replaying a batch after a lost
/// acknowledgement leaves the mirror unchanged. Calls, concurrency and
/// failures are observable so tests can assert on delivery behaviour.
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency_ms: AtomicU64,
    reachable: AtomicBool,
}

impl MemoryTransport {
    /// Create a reachable transport with no latency.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// Delay every call by `latency` before it completes.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Toggle reachability for both `send` and `probe`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with `kind`.
    pub fn fail_next(&self, count: usize, kind: FailureKind) {
        let mut inner = self.lock();
        inner.scripted.extend(std::iter::repeat(kind).take(count));
    }

    /// Number of `send` calls received, successful or not.
    pub fn send_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Accepted batches in the order they arrived.
    pub fn accepted_batches(&self) -> Vec<Batch> {
        self.lock().accepted.clone()
    }

    /// Distinct records held by the mirror, in first-applied order.
    pub fn applied_records(&self) -> Vec<ChangeRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.applied.get(id).cloned())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, batch: &Batch) {
        let mut inner = self.lock();
        for record in &batch.records {
            if !inner.applied.contains_key(&record.id) {
                inner.order.push(record.id);
                inner.applied.insert(record.id, record.clone());
            }
        }
        inner.accepted.push(batch.clone());
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, batch: &Batch) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Transport("remote unreachable".to_string()));
        }

        let scripted = self.lock().scripted.pop_front();
        if let Some(kind) = scripted {
            return Err(kind.into_error());
        }

        self.apply(batch);
        Ok(())
    }

    async fn probe(&self) -> Result<bool> {
        Ok(self.reachable.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::{SequenceNumber, TargetId};
    use serde_json::json;
    use std::sync::Arc;

    fn batch(records: Vec<ChangeRecord>) -> Batch {
        Batch::new(TargetId::new("inventory").unwrap(), "ff", records)
    }

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord::new(SequenceNumber::new(seq), json!({ "sku": seq }))
    }

    #[tokio::test]
    async fn test_send_applies_records() {
        let transport = MemoryTransport::new();
        transport.send(&batch(vec![record(1), record(2)])).await.unwrap();

        assert_eq!(transport.send_count(), 1);
        assert_eq!(transport.applied_records().len(), 2);
        assert_eq!(transport.accepted_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let transport = MemoryTransport::new();
        let records = vec![record(1), record(2)];

        transport.send(&batch(records.clone())).await.unwrap();
        transport.send(&batch(records)).await.unwrap();

        assert_eq!(transport.send_count(), 2);
        assert_eq!(transport.applied_records().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next(1, FailureKind::Network);
        transport.fail_next(1, FailureKind::Rejected);

        let first = transport.send(&batch(vec![record(1)])).await;
        assert!(matches!(first, Err(Error::Transport(_))));

        let second = transport.send(&batch(vec![record(1)])).await;
        assert!(matches!(second, Err(Error::Rejected(_))));

        transport.send(&batch(vec![record(1)])).await.unwrap();
        assert_eq!(transport.applied_records().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);

        assert!(!transport.probe().await.unwrap());
        let result = transport.send(&batch(vec![record(1)])).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(transport.applied_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_in_flight_tracks_overlap() {
        let transport =
            Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(50)));

        let a = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&batch(vec![record(1)])).await })
        };
        let b = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&batch(vec![record(2)])).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transport.peak_in_flight(), 2);
    }
}
