//! Connectivity tracking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use offsync_common::{ConnectivityState, Result};
use offsync_transport::RemoteTransport;

/// Current view of whether the remote can be reached.
///
/// The host reports transitions from whatever source it has (OS network
/// events, failed requests, the probe loop). Only real transitions are
/// published to subscribers; repeated reports of the same state are dropped.
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Report the current state. Returns true if this was a transition.
    pub fn report(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", state);
        }
        changed
    }

    pub fn report_online(&self) -> bool {
        self.report(ConnectivityState::Online)
    }

    pub fn report_offline(&self) -> bool {
        self.report(ConnectivityState::Offline)
    }

    /// Fold a probe result into the current state. A failed probe means offline.
    pub fn report_probe(&self, result: Result<bool>) -> bool {
        match result {
            Ok(reachable) => self.report(ConnectivityState::from(reachable)),
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                self.report(ConnectivityState::Offline)
            }
        }
    }

    /// Probe the transport every `interval` until the task is aborted.
    ///
    /// A probe that takes longer than the interval counts as unreachable.
    pub fn spawn_probe(
        self: &Arc<Self>,
        transport: Arc<dyn RemoteTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Probing {} every {:?}", transport.name(), interval);

            loop {
                ticker.tick().await;
                let result = match tokio::time::timeout(interval, transport.probe()).await {
                    Ok(result) => result,
                    Err(_) => Ok(false),
                };
                monitor.report_probe(result);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
