//! Sync engine facade that front ends talk to.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::{Command, CoordinatorParts, SyncCoordinator, SyncOutcome};
use crate::fingerprint::SnapshotSource;
use crate::queue::PendingQueue;
use crate::status::{StatusPublisher, SyncStatus};
use offsync_common::{ChangeRecord, Error, Result, SequenceNumber, TargetId};
use offsync_transport::RemoteTransport;

/// Capacity of the coordinator command channel.
const COMMAND_BUFFER: usize = 256;

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    transport: Arc<dyn RemoteTransport>,
    config: SyncConfig,
    queue: Option<PendingQueue>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already opened queue instead of the one named by the config.
    pub fn queue(mut self, queue: PendingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Fingerprint the application's logical state instead of the pending records.
    pub fn snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot_source = Some(source);
        self
    }

    /// Open the queue and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `Error::Configuration` if the config is invalid
    /// - Errors opening the persisted queue
    pub async fn start(self) -> Result<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let queue = match self.queue {
            Some(queue) => queue,
            None => match &config.state_path {
                Some(path) => PendingQueue::open(path, config.queue_capacity).await?,
                None => PendingQueue::in_memory(config.queue_capacity),
            },
        };
        let pending = queue.size();

        let connectivity = Arc::new(ConnectivityMonitor::new(config.initial_connectivity()));
        let status = Arc::new(StatusPublisher::new(SyncStatus::new(
            connectivity.current(),
            pending,
        )));
        let queue = Arc::new(RwLock::new(queue));
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let coordinator = SyncCoordinator::new(
            CoordinatorParts {
                transport: Arc::clone(&self.transport),
                queue: Arc::clone(&queue),
                status: Arc::clone(&status),
                connectivity: Arc::clone(&connectivity),
                snapshot_source: self.snapshot_source,
            },
            &config,
            commands_rx,
        );
        let coordinator = tokio::spawn(coordinator.run());

        let probe = config
            .probe_interval
            .map(|interval| connectivity.spawn_probe(Arc::clone(&self.transport), interval));

        if pending > 0 {
            // Resume delivery of changes left over from a previous run.
            let _ = commands.try_send(Command::Changed);
        }

        info!(
            "Sync engine started ({} pending, transport: {})",
            pending,
            self.transport.name()
        );

        Ok(SyncEngine {
            queue,
            status,
            connectivity,
            commands,
            coordinator: Some(coordinator),
            probe,
            config,
        })
    }
}

/// Offline-first sync engine.
///
/// Every captured change lands in the pending queue first. A background
/// coordinator ships the queue to the remote after a quiet period, keeps it
/// intact across failures and defers while offline. Dropping the engine
/// without calling [`SyncEngine::shutdown`] stops the background tasks
/// without waiting for an outstanding transport call.
pub struct SyncEngine {
    queue: Arc<RwLock<PendingQueue>>,
    status: Arc<StatusPublisher>,
    connectivity: Arc<ConnectivityMonitor>,
    commands: mpsc::Sender<Command>,
    coordinator: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn builder(transport: Arc<dyn RemoteTransport>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            transport,
            config: SyncConfig::default(),
            queue: None,
            snapshot_source: None,
        }
    }

    /// Record a local change.
    ///
    /// The change is durable in the queue before this returns. It is captured
    /// even when sync is disabled, offline or has no target.
    ///
    /// # Errors
    /// - `Error::Capacity` when the queue is full
    /// - I/O errors persisting the queue
    pub async fn notify_change(&self, payload: Value) -> Result<SequenceNumber> {
        let sequence = {
            let mut queue = self.queue.write().await;
            let sequence = queue.enqueue(payload).await?;
            self.status.set_pending(queue.size());
            sequence
        };

        match self.commands.try_send(Command::Changed) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Sync coordinator is not running, change {} stays queued", sequence);
            }
        }

        Ok(sequence)
    }

    /// Change the remote target. `None` stops syncing until a target is set.
    pub async fn set_sync_target(&self, target: Option<TargetId>) -> Result<()> {
        self.send(Command::SetTarget(target)).await
    }

    /// Turn automatic sync on or off. Changes are captured either way.
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetEnabled(enabled)).await
    }

    /// Attempt a sync right away and wait for its outcome.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::SyncNow(reply)).await?;
        outcome
            .await
            .map_err(|_| Error::Engine("Failed to receive sync outcome".to_string()))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.status()
    }

    /// Receive status updates as they happen.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Connectivity monitor the host reports network transitions to.
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Undelivered records, lowest sequence first.
    pub async fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.queue.read().await.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stop the background tasks, letting an outstanding transport call finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }

        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(coordinator) = self.coordinator.take() {
            coordinator
                .await
                .map_err(|e| Error::Engine(format!("Sync coordinator failed: {}", e)))?;
        }

        info!("Sync engine stopped ({} pending)", self.status.status().pending);
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Engine("Sync coordinator not running".to_string()))
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        if let Some(coordinator) = self.coordinator.take() {
            debug!("Sync engine dropped without shutdown");
            coordinator.abort();
        }
    }
}
