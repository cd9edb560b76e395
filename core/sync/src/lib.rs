//! Offsync Sync Engine
//!
//! Offline-first delivery of local changes to a remote system of record:
//! - Durable pending queue with monotonic sequence numbers
//! - Debounced sync of the full undelivered snapshot
//! - Connectivity tracking with deferral while offline
//! - Exponential backoff and rejection escalation on failure
//! - Content fingerprints to skip no-op syncs
//! - Observable status for UIs

pub mod backoff;
pub mod config;
pub mod connectivity;
mod coordinator;
pub mod debounce;
pub mod engine;
pub mod fingerprint;
pub mod queue;
pub mod status;

// Re-export main types
pub use backoff::BackoffConfig;
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{SkipReason, SyncOutcome};
pub use debounce::Debouncer;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use fingerprint::{fingerprint_records, Fingerprint, FingerprintBuilder, SnapshotSource};
pub use queue::PendingQueue;
pub use status::{StatusPublisher, SyncPhase, SyncStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _backoff = BackoffConfig::default();
        let _queue = PendingQueue::in_memory(1);
        let _monitor = ConnectivityMonitor::default();
    }
}
