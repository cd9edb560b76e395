//! Observable sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use offsync_common::{ConnectivityState, Error};

/// Where the coordinator is in its sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Nothing scheduled.
    Idle,
    /// A sync is scheduled, or waiting for connectivity.
    Armed,
    /// A transport call is running.
    Syncing,
    /// The last attempt failed; a retry may be scheduled.
    FailedBackoff,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Armed => "armed",
            SyncPhase::Syncing => "syncing",
            SyncPhase::FailedBackoff => "failed (backing off)",
        };
        f.write_str(s)
    }
}

/// Snapshot of engine state for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    /// Undelivered records.
    pub pending: usize,
    /// True exactly while a transport call is running.
    pub syncing: bool,
    pub phase: SyncPhase,
    /// Repeated rejections stopped automatic retries.
    pub needs_attention: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn new(connectivity: ConnectivityState, pending: usize) -> Self {
        Self {
            connectivity,
            pending,
            syncing: false,
            phase: SyncPhase::Idle,
            needs_attention: false,
            last_synced_at: None,
            last_error: None,
        }
    }

    /// Everything captured has been delivered.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && !self.syncing
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {} pending, {}", self.connectivity, self.pending, self.phase)?;
        if self.needs_attention {
            write!(f, ", needs attention")?;
        }
        Ok(())
    }
}

/// Single-writer publisher of [`SyncStatus`].
///
/// Subscribers are only woken when a field actually changes.
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn status(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn set_connectivity(&self, connectivity: ConnectivityState) {
        self.update(|s| replace(&mut s.connectivity, connectivity));
    }

    pub fn set_pending(&self, pending: usize) {
        self.update(|s| replace(&mut s.pending, pending));
    }

    /// Set the phase. `syncing` is derived from it in the same update.
    pub fn set_phase(&self, phase: SyncPhase) {
        self.update(|s| {
            let phase_changed = replace(&mut s.phase, phase);
            let syncing_changed = replace(&mut s.syncing, phase == SyncPhase::Syncing);
            phase_changed || syncing_changed
        });
    }

    /// Record a delivered batch. Clears the error state.
    pub fn record_success(&self, at: DateTime<Utc>) {
        self.update(|s| {
            s.last_synced_at = Some(at);
            s.last_error = None;
            s.needs_attention = false;
            true
        });
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, error: &Error, needs_attention: bool) {
        let message = error.to_string();
        self.update(|s| {
            let error_changed = replace(&mut s.last_error, Some(message));
            let attention_changed = replace(&mut s.needs_attention, needs_attention);
            error_changed || attention_changed
        });
    }

    pub fn set_needs_attention(&self, needs_attention: bool) {
        self.update(|s| replace(&mut s.needs_attention, needs_attention));
    }

    fn update(&self, modify: impl FnOnce(&mut SyncStatus) -> bool) {
        self.tx.send_if_modified(modify);
    }
}

/// Assign and report whether the value changed.
fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> StatusPublisher {
        StatusPublisher::new(SyncStatus::new(ConnectivityState::Online, 0))
    }

    #[test]
    fn test_syncing_follows_phase() {
        let publisher = publisher();

        publisher.set_phase(SyncPhase::Syncing);
        let status = publisher.status();
        assert!(status.syncing);
        assert_eq!(status.phase, SyncPhase::Syncing);

        publisher.set_phase(SyncPhase::FailedBackoff);
        assert!(!publisher.status().syncing);
    }

    #[test]
    fn test_unchanged_values_do_not_notify() {
        let publisher = publisher();
        let rx = publisher.subscribe();

        publisher.set_pending(0);
        publisher.set_phase(SyncPhase::Idle);
        assert!(!rx.has_changed().unwrap());

        publisher.set_pending(3);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_success_clears_failure() {
        let publisher = publisher();
        publisher.record_failure(&Error::Rejected("bad row".to_string()), true);

        let status = publisher.status();
        assert!(status.needs_attention);
        assert!(status.last_error.as_deref().unwrap().contains("bad row"));

        publisher.record_success(Utc::now());
        let status = publisher.status();
        assert!(!status.needs_attention);
        assert!(status.last_error.is_none());
        assert!(status.last_synced_at.is_some());
    }

    #[test]
    fn test_display() {
        let mut status = SyncStatus::new(ConnectivityState::Offline, 2);
        status.phase = SyncPhase::Armed;
        assert_eq!(status.to_string(), "offline, 2 pending, armed");
        assert!(!status.is_settled());
    }
}
