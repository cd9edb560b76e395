//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use offsync_common::{ConnectivityState, Error, Result, TargetId};

/// Default quiet period before a burst of changes is synced.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Default bound on a single transport call.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of undelivered records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default number of consecutive rejections before automatic retries stop.
pub const DEFAULT_REJECTION_THRESHOLD: u32 = 3;

/// Configuration for a sync engine.
///
/// Durations are expressed in milliseconds when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether automatic sync is on. Changes are always captured.
    pub enabled: bool,
    /// Remote collection to mirror into. Nothing is sent while unset.
    pub target: Option<TargetId>,
    /// Quiet period after the last change before a sync fires.
    #[serde(with = "millis", rename = "debounce_ms")]
    pub debounce: Duration,
    /// Upper bound for one transport call.
    #[serde(with = "millis", rename = "transport_timeout_ms")]
    pub transport_timeout: Duration,
    /// Maximum number of undelivered records.
    pub queue_capacity: usize,
    /// Where the pending queue is persisted. In-memory when unset.
    pub state_path: Option<PathBuf>,
    /// Consecutive rejections after which the engine waits for a new change.
    pub rejection_threshold: u32,
    /// Retry delays after failed attempts.
    pub backoff: BackoffConfig,
    /// Interval of the reachability probe loop. No probing when unset.
    #[serde(with = "millis::option", rename = "probe_interval_ms")]
    pub probe_interval: Option<Duration>,
    /// Connectivity assumed before the first report arrives.
    pub start_online: bool,
}

impl SyncConfig {
    /// Create a configuration with defaults syncing into `target`.
    pub fn new(target: TargetId) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    /// Set the debounce delay.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the transport timeout.
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Persist the pending queue at `path`.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Set the rejection threshold.
    pub fn with_rejection_threshold(mut self, threshold: u32) -> Self {
        self.rejection_threshold = threshold;
        self
    }

    /// Set the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable the reachability probe loop.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = Some(interval);
        self
    }

    /// Set whether sync starts enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the connectivity assumed at start.
    pub fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    pub fn initial_connectivity(&self) -> ConnectivityState {
        ConnectivityState::from(self.start_online)
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    /// - `Error::Configuration` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.transport_timeout.is_zero() {
            return Err(Error::Configuration(
                "transport_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Configuration(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.rejection_threshold == 0 {
            return Err(Error::Configuration(
                "rejection_threshold must be greater than zero".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::Configuration(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.probe_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::Configuration(
                "probe_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: None,
            debounce: DEFAULT_DEBOUNCE,
            transport_timeout: DEFAULT_TRANSPORT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            state_path: None,
            rejection_threshold: DEFAULT_REJECTION_THRESHOLD,
            backoff: BackoffConfig::default(),
            probe_interval: None,
            start_online: true,
        }
    }
}

/// Serde helpers storing `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
