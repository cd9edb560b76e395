//! Sync coordinator - the single task that decides when to talk to the remote.
//!
//! All engine state transitions happen on this task. Front ends talk to it
//! through [`Command`]s; connectivity arrives over a watch channel; the
//! transport call runs in its own task so commands keep flowing while it is
//! outstanding.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffConfig;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::debounce::Debouncer;
use crate::fingerprint::{fingerprint_records, Fingerprint, FingerprintBuilder, SnapshotSource};
use crate::queue::PendingQueue;
use crate::status::{StatusPublisher, SyncPhase};
use offsync_common::{ChangeRecord, ConnectivityState, Error, Result, SequenceNumber, TargetId};
use offsync_transport::{Batch, RemoteTransport};

/// Requests sent to the coordinator task.
#[derive(Debug)]
pub(crate) enum Command {
    /// A change was enqueued.
    Changed,
    SetTarget(Option<TargetId>),
    SetEnabled(bool),
    /// Attempt a sync immediately, bypassing the debounce delay.
    SyncNow(oneshot::Sender<SyncOutcome>),
    Shutdown,
}

/// Why an attempt did not reach the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NoTarget,
    /// Deferred until connectivity returns.
    Offline,
    /// Another attempt is still running.
    InFlight,
    NothingPending,
}

/// Result of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The batch was accepted and acknowledged locally.
    Delivered {
        records: usize,
        high_water: SequenceNumber,
    },
    /// The logical state matched the last delivered one; nothing was sent.
    Unchanged { acknowledged: usize },
    Skipped(SkipReason),
    /// The attempt failed; the queue is untouched.
    Failed { error: String, transient: bool },
}

/// The transport task currently running.
struct InFlight {
    handle: JoinHandle<Result<()>>,
    high_water: SequenceNumber,
    records: usize,
    fingerprint: Fingerprint,
    waiter: Option<oneshot::Sender<SyncOutcome>>,
}

/// Shared state the coordinator works on.
pub(crate) struct CoordinatorParts {
    pub transport: Arc<dyn RemoteTransport>,
    pub queue: Arc<RwLock<PendingQueue>>,
    pub status: Arc<StatusPublisher>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub snapshot_source: Option<Arc<dyn SnapshotSource>>,
}

pub(crate) struct SyncCoordinator {
    transport: Arc<dyn RemoteTransport>,
    queue: Arc<RwLock<PendingQueue>>,
    status: Arc<StatusPublisher>,
    connectivity: Arc<ConnectivityMonitor>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    commands: mpsc::Receiver<Command>,
    connectivity_rx: watch::Receiver<ConnectivityState>,

    debouncer: Debouncer,
    backoff: BackoffConfig,
    transport_timeout: Duration,
    rejection_threshold: u32,

    enabled: bool,
    target: Option<TargetId>,
    /// An attempt found the engine offline and is owed a retry.
    deferred: bool,
    /// Backoff retries stopped after repeated rejections.
    awaiting_change: bool,
    /// A change arrived after the running call took its snapshot.
    changed_during_call: bool,
    in_flight: Option<InFlight>,
    /// Fingerprint of the last delivered state. Not persisted.
    last_fingerprint: Option<Fingerprint>,
    consecutive_failures: u32,
    consecutive_rejections: u32,
}

impl SyncCoordinator {
    pub(crate) fn new(
        parts: CoordinatorParts,
        config: &SyncConfig,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        // Subscribe before the task runs so no transition is missed.
        let connectivity_rx = parts.connectivity.subscribe();
        Self {
            transport: parts.transport,
            queue: parts.queue,
            status: parts.status,
            connectivity: parts.connectivity,
            snapshot_source: parts.snapshot_source,
            commands,
            connectivity_rx,
            debouncer: Debouncer::new(config.debounce),
            backoff: config.backoff.clone(),
            transport_timeout: config.transport_timeout,
            rejection_threshold: config.rejection_threshold,
            enabled: config.enabled,
            target: config.target.clone(),
            deferred: false,
            awaiting_change: false,
            changed_during_call: false,
            in_flight: None,
            last_fingerprint: None,
            consecutive_failures: 0,
            consecutive_rejections: 0,
        }
    }

    /// Run until a `Shutdown` command arrives or every sender is dropped.
    pub(crate) async fn run(mut self) {
        info!(
            "Sync coordinator started (transport: {}, target: {})",
            self.transport.name(),
            self.target
                .as_ref()
                .map(|t| t.as_str())
                .unwrap_or("<none>")
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                changed = self.connectivity_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.connectivity_rx.borrow_and_update();
                    self.on_connectivity(state).await;
                }
                _ = self.debouncer.fired() => {
                    if let Some(outcome) = self.attempt(None).await {
                        debug!("Scheduled sync: {:?}", outcome);
                    }
                }
                joined = wait_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.on_attempt_finished(joined).await;
                }
            }
        }

        self.stop().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Changed => self.on_change(),
            Command::SetTarget(target) => self.on_set_target(target).await,
            Command::SetEnabled(enabled) => self.on_set_enabled(enabled).await,
            Command::SyncNow(reply) => {
                self.debouncer.cancel();
                if let Some(outcome) = self.attempt(Some(reply)).await {
                    debug!("Manual sync: {:?}", outcome);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn eligible(&self) -> bool {
        self.enabled && self.target.is_some()
    }

    fn on_change(&mut self) {
        // A running attempt re-checks the queue when it finishes.
        if self.in_flight.is_some() {
            self.changed_during_call = true;
            return;
        }
        if !self.eligible() {
            return;
        }
        self.awaiting_change = false;
        self.debouncer.schedule();
        self.status.set_phase(SyncPhase::Armed);
    }

    async fn on_set_target(&mut self, target: Option<TargetId>) {
        if target == self.target {
            return;
        }
        info!(
            "Sync target set to {}",
            target.as_ref().map(|t| t.as_str()).unwrap_or("<none>")
        );
        self.target = target;
        self.last_fingerprint = None;
        self.consecutive_failures = 0;
        self.consecutive_rejections = 0;
        self.awaiting_change = false;
        self.status.set_needs_attention(false);

        if self.target.is_some() {
            self.rearm_if_pending().await;
        } else {
            self.disarm();
        }
    }

    async fn on_set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        info!("Automatic sync {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;

        if enabled {
            self.rearm_if_pending().await;
        } else {
            // Pending records stay queued.
            self.disarm();
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        self.status.set_connectivity(state);
        if !state.is_online() {
            return;
        }
        if self.deferred {
            debug!("Back online, resuming deferred sync");
        }
        self.deferred = false;
        self.awaiting_change = false;
        // Reconnecting replaces any backoff deadline with a fresh debounce.
        self.rearm_if_pending().await;
    }

    /// Arm the debouncer if there is undelivered work and sync may run.
    async fn rearm_if_pending(&mut self) {
        if self.in_flight.is_some() || !self.eligible() || self.awaiting_change {
            return;
        }
        if self.queue.read().await.is_empty() {
            return;
        }
        self.debouncer.schedule();
        self.status.set_phase(SyncPhase::Armed);
    }

    fn disarm(&mut self) {
        self.debouncer.cancel();
        self.deferred = false;
        if self.in_flight.is_none() {
            self.status.set_phase(SyncPhase::Idle);
        }
    }

    fn fingerprint(&self, snapshot: &[ChangeRecord]) -> Fingerprint {
        match &self.snapshot_source {
            Some(source) => {
                let mut builder = FingerprintBuilder::new();
                source.write_snapshot(&mut builder);
                builder.finish()
            }
            None => fingerprint_records(snapshot),
        }
    }

    /// Try to start a sync.
    ///
    /// Returns the outcome when the attempt finished without a transport call,
    /// or `None` when a call was started. The outcome is also sent to `reply`.
    async fn attempt(&mut self, reply: Option<oneshot::Sender<SyncOutcome>>) -> Option<SyncOutcome> {
        let outcome = match self.prepare().await {
            Ok((batch, fingerprint)) => {
                self.start(batch, fingerprint, reply);
                return None;
            }
            Err(outcome) => outcome,
        };

        if let Some(reply) = reply {
            let _ = reply.send(outcome.clone());
        }
        Some(outcome)
    }

    /// Build the next batch, or settle the attempt without one.
    async fn prepare(&mut self) -> std::result::Result<(Batch, Fingerprint), SyncOutcome> {
        if self.in_flight.is_some() {
            return Err(SyncOutcome::Skipped(SkipReason::InFlight));
        }
        if !self.enabled {
            self.status.set_phase(SyncPhase::Idle);
            return Err(SyncOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(target) = self.target.clone() else {
            debug!("No sync target configured, skipping");
            self.status.set_phase(SyncPhase::Idle);
            return Err(SyncOutcome::Skipped(SkipReason::NoTarget));
        };
        if !self.connectivity.is_online() {
            debug!("Offline, deferring sync until connectivity returns");
            self.deferred = true;
            self.status.set_phase(SyncPhase::Armed);
            return Err(SyncOutcome::Skipped(SkipReason::Offline));
        }

        let snapshot = self.queue.read().await.snapshot();
        let Some(last) = snapshot.last() else {
            self.status.set_phase(SyncPhase::Idle);
            return Err(SyncOutcome::Skipped(SkipReason::NothingPending));
        };
        let high_water = last.sequence;

        let fingerprint = self.fingerprint(&snapshot);
        if self.last_fingerprint == Some(fingerprint) {
            let acknowledged = self.acknowledge(high_water).await;
            info!(
                "State unchanged since last sync, acknowledged {} changes without sending",
                acknowledged
            );
            self.status.set_phase(SyncPhase::Idle);
            return Err(SyncOutcome::Unchanged { acknowledged });
        }

        Ok((Batch::new(target, fingerprint.to_hex(), snapshot), fingerprint))
    }

    fn start(
        &mut self,
        batch: Batch,
        fingerprint: Fingerprint,
        waiter: Option<oneshot::Sender<SyncOutcome>>,
    ) {
        let high_water = batch.high_water();
        let records = batch.len();
        info!(
            "Syncing {} changes up to {} to {}",
            records, high_water, batch.target
        );

        let transport = Arc::clone(&self.transport);
        let timeout = self.transport_timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.send(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "transport call did not complete within {:?}",
                    timeout
                ))),
            }
        });

        self.changed_during_call = false;
        self.status.set_phase(SyncPhase::Syncing);
        self.in_flight = Some(InFlight {
            handle,
            high_water,
            records,
            fingerprint,
            waiter,
        });
    }

    async fn on_attempt_finished(&mut self, joined: std::result::Result<Result<()>, JoinError>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let result = joined
            .unwrap_or_else(|e| Err(Error::Engine(format!("Transport task failed: {}", e))));

        let outcome = match result {
            Ok(()) => self.on_delivered(&in_flight).await,
            Err(error) => self.on_failed(error),
        };

        if let Some(waiter) = in_flight.waiter {
            let _ = waiter.send(outcome);
        }
    }

    async fn on_delivered(&mut self, in_flight: &InFlight) -> SyncOutcome {
        self.last_fingerprint = Some(in_flight.fingerprint);
        self.consecutive_failures = 0;
        self.consecutive_rejections = 0;
        self.awaiting_change = false;
        // Before acknowledging, so a persist failure stays in `last_error`.
        self.status.record_success(Utc::now());
        self.acknowledge(in_flight.high_water).await;
        self.status.set_phase(SyncPhase::Idle);
        info!(
            "Delivered {} changes up to {}",
            in_flight.records, in_flight.high_water
        );

        // Changes captured while the call was running.
        self.rearm_if_pending().await;

        SyncOutcome::Delivered {
            records: in_flight.records,
            high_water: in_flight.high_water,
        }
    }

    fn on_failed(&mut self, error: Error) -> SyncOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if error.is_rejection() {
            self.consecutive_rejections = self.consecutive_rejections.saturating_add(1);
        } else {
            self.consecutive_rejections = 0;
        }
        let needs_attention = self.consecutive_rejections >= self.rejection_threshold;

        warn!(
            "Sync attempt failed ({} in a row): {}",
            self.consecutive_failures, error
        );
        self.status.record_failure(&error, needs_attention);

        if !self.eligible() {
            self.status.set_phase(SyncPhase::Idle);
        } else if needs_attention && self.changed_during_call {
            // The next batch carries records the remote has not seen yet.
            debug!("Changes arrived during the rejected call, retrying");
            self.debouncer.schedule();
            self.status.set_phase(SyncPhase::Armed);
        } else if needs_attention {
            self.awaiting_change = true;
            warn!(
                "Remote rejected {} batches in a row, waiting for a new change before retrying",
                self.consecutive_rejections
            );
            self.status.set_phase(SyncPhase::FailedBackoff);
        } else {
            let delay = self
                .backoff
                .delay_for_attempt(self.consecutive_failures - 1)
                .max(self.debouncer.delay());
            debug!("Retrying in {:?}", delay);
            self.debouncer.schedule_after(delay);
            self.status.set_phase(SyncPhase::FailedBackoff);
        }

        SyncOutcome::Failed {
            transient: error.is_transient(),
            error: error.to_string(),
        }
    }

    /// Acknowledge up to `high_water` and publish the new pending count.
    ///
    /// Returns the number of records dropped from memory. A failed write
    /// leaves the state file behind the in-memory queue; it is reported in
    /// the status and corrected by the next successful persist.
    async fn acknowledge(&self, high_water: SequenceNumber) -> usize {
        let mut queue = self.queue.write().await;
        let before = queue.size();
        if let Err(e) = queue.acknowledge_up_to(high_water).await {
            error!("Failed to persist acknowledgement up to {}: {}", high_water, e);
            let needs_attention = self.consecutive_rejections >= self.rejection_threshold;
            self.status.record_failure(&e, needs_attention);
        }
        let removed = before - queue.size();
        self.status.set_pending(queue.size());
        removed
    }

    /// Let an outstanding call finish, then go idle.
    async fn stop(&mut self) {
        self.debouncer.cancel();
        if let Some(in_flight) = self.in_flight.as_mut() {
            info!("Waiting for in-flight sync to finish");
            let joined = (&mut in_flight.handle).await;
            self.on_attempt_finished(joined).await;
        }
        self.debouncer.cancel();
        self.status.set_phase(SyncPhase::Idle);
        info!("Sync coordinator stopped");
    }
}

/// Resolve when the running transport task completes.
async fn wait_in_flight(
    in_flight: &mut Option<InFlight>,
) -> std::result::Result<Result<()>, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => std::future::pending().await,
    }
}
