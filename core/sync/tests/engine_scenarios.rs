//! End-to-end behaviour of the sync engine against the in-memory transport.
//!
//! All tests run on a paused clock, so debounce and latency values are exact.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};

use offsync_common::{SequenceNumber, TargetId};
use offsync_sync::{
    BackoffConfig, FingerprintBuilder, SnapshotSource, SyncConfig, SyncEngine, SyncOutcome,
    SyncPhase, SyncStatus,
};
use offsync_transport::{FailureKind, MemoryTransport};

const DEBOUNCE: Duration = Duration::from_millis(100);

fn config() -> SyncConfig {
    SyncConfig::new(TargetId::new("attendance").unwrap())
        .with_debounce(DEBOUNCE)
        .with_transport_timeout(Duration::from_secs(1))
        .with_backoff(
            BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(5)).with_jitter(false),
        )
}

async fn start(transport: &Arc<MemoryTransport>, config: SyncConfig) -> SyncEngine {
    SyncEngine::builder(transport.clone())
        .config(config)
        .start()
        .await
        .unwrap()
}

/// Wait until the published status satisfies `pred`.
async fn wait_for(engine: &SyncEngine, pred: impl FnMut(&SyncStatus) -> bool) {
    let mut rx = engine.subscribe();
    timeout(Duration::from_secs(60), rx.wait_for(pred))
        .await
        .expect("status condition not reached")
        .expect("status channel closed");
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_is_sent_once() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = start(&transport, config()).await;

    for i in 0..10 {
        engine.notify_change(json!({ "row": i })).await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    sleep(DEBOUNCE * 2).await;

    assert_eq!(transport.send_count(), 1);
    let batches = transport.accepted_batches();
    assert_eq!(batches[0].len(), 10);
    assert_eq!(batches[0].high_water(), SequenceNumber::new(10));
    assert_eq!(batches[0].target.as_str(), "attendance");

    let status = engine.status();
    assert_eq!(status.pending, 0);
    assert!(!status.syncing);
    assert_eq!(status.phase, SyncPhase::Idle);
    assert!(status.last_synced_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_attempt_keeps_every_record() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(1, FailureKind::Network);
    let engine = start(&transport, config()).await;

    for i in 0..3 {
        engine.notify_change(json!({ "row": i })).await.unwrap();
    }
    let captured = engine.pending_changes().await;

    wait_for(&engine, |s| s.last_error.is_some()).await;
    let status = engine.status();
    assert_eq!(status.pending, 3);
    assert_eq!(status.phase, SyncPhase::FailedBackoff);
    assert!(!status.syncing);
    assert!(!status.needs_attention);
    assert_eq!(engine.pending_changes().await, captured);

    // Backoff retry delivers the same records.
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 2);
    let applied = transport.applied_records();
    assert_eq!(applied, captured);
    assert!(engine.status().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn offline_changes_are_deferred_until_reconnect() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = start(&transport, config()).await;

    for i in 0..5 {
        engine.notify_change(json!({ "present": i })).await.unwrap();
    }
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 1);

    engine.connectivity().report_offline();
    engine.notify_change(json!({ "present": 5 })).await.unwrap();
    engine.notify_change(json!({ "present": 6 })).await.unwrap();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.send_count(), 1);
    let status = engine.status();
    assert_eq!(status.pending, 2);
    assert_eq!(status.phase, SyncPhase::Armed);
    assert!(!status.connectivity.is_online());

    let reconnected = Instant::now();
    engine.connectivity().report_online();
    wait_for(&engine, |s| s.pending == 0).await;

    assert!(reconnected.elapsed() <= DEBOUNCE);
    assert_eq!(transport.send_count(), 2);
    let batches = transport.accepted_batches();
    assert_eq!(batches[1].len(), 2);
    assert_eq!(batches[1].records[0].sequence, SequenceNumber::new(6));
    assert_eq!(transport.applied_records().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn only_one_transport_call_runs_at_a_time() {
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(500)));
    let engine = start(
        &transport,
        config().with_transport_timeout(Duration::from_secs(5)),
    )
    .await;

    engine.notify_change(json!("a")).await.unwrap();
    wait_for(&engine, |s| s.syncing).await;

    engine.notify_change(json!("b")).await.unwrap();
    engine.notify_change(json!("c")).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.send_count(), 1);
    assert!(engine.status().syncing);

    wait_for(&engine, |s| s.pending == 0 && !s.syncing).await;

    assert_eq!(transport.send_count(), 2);
    assert_eq!(transport.peak_in_flight(), 1);
    let batches = transport.accepted_batches();
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[1].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_transport_times_out_without_losing_data() {
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_secs(5)));
    let engine = start(&transport, config()).await;

    engine.notify_change(json!({ "id": 1 })).await.unwrap();
    wait_for(&engine, |s| s.last_error.is_some()).await;

    let status = engine.status();
    assert!(status.last_error.unwrap().starts_with("Timed out"));
    assert_eq!(status.pending, 1);
    assert!(!status.syncing);
    assert!(transport.applied_records().is_empty());

    transport.set_latency(Duration::ZERO);
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.applied_records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_rejections_wait_for_a_new_change() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(2, FailureKind::Rejected);
    let engine = start(&transport, config().with_rejection_threshold(2)).await;

    engine.notify_change(json!({ "qty": -1 })).await.unwrap();
    wait_for(&engine, |s| s.needs_attention).await;
    assert_eq!(transport.send_count(), 2);

    // No automatic retries once escalated.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.send_count(), 2);
    let status = engine.status();
    assert_eq!(status.pending, 1);
    assert_eq!(status.phase, SyncPhase::FailedBackoff);

    engine.notify_change(json!({ "qty": 1 })).await.unwrap();
    wait_for(&engine, |s| s.pending == 0).await;

    assert_eq!(transport.send_count(), 3);
    assert_eq!(transport.accepted_batches()[0].len(), 2);
    assert!(!engine.status().needs_attention);
}

#[tokio::test(start_paused = true)]
async fn reconnect_retries_after_rejection_escalation() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(1, FailureKind::Rejected);
    let engine = start(&transport, config().with_rejection_threshold(1)).await;

    engine.notify_change(json!("fixed upstream")).await.unwrap();
    wait_for(&engine, |s| s.needs_attention).await;

    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.send_count(), 1);

    engine.connectivity().report_offline();
    engine.connectivity().report_online();
    wait_for(&engine, |s| s.pending == 0).await;

    assert_eq!(transport.send_count(), 2);
    assert!(!engine.status().needs_attention);
}

#[tokio::test(start_paused = true)]
async fn change_during_rejected_call_is_still_sent() {
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(500)));
    transport.fail_next(1, FailureKind::Rejected);
    let engine = start(
        &transport,
        config()
            .with_transport_timeout(Duration::from_secs(5))
            .with_rejection_threshold(1),
    )
    .await;

    engine.notify_change(json!("a")).await.unwrap();
    wait_for(&engine, |s| s.syncing).await;
    engine.notify_change(json!("b")).await.unwrap();

    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 2);
    let batches = transport.accepted_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert!(!engine.status().needs_attention);
}

#[tokio::test(start_paused = true)]
async fn reconnect_during_backoff_syncs_within_debounce() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(1, FailureKind::Network);
    let engine = start(
        &transport,
        config().with_backoff(
            BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(60)).with_jitter(false),
        ),
    )
    .await;

    engine.notify_change(json!({ "row": 1 })).await.unwrap();
    wait_for(&engine, |s| s.last_error.is_some()).await;
    assert_eq!(transport.send_count(), 1);

    engine.connectivity().report_offline();
    sleep(Duration::from_millis(50)).await;
    let reconnected = Instant::now();
    engine.connectivity().report_online();
    wait_for(&engine, |s| s.pending == 0).await;

    assert!(reconnected.elapsed() <= DEBOUNCE);
    assert_eq!(transport.send_count(), 2);
}

/// Application rows mirrored to the remote.
#[derive(Default)]
struct Rows(Mutex<BTreeMap<String, Value>>);

impl Rows {
    fn set(&self, key: &str, value: Value) {
        self.0.lock().unwrap().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.0.lock().unwrap().remove(key);
    }
}

impl SnapshotSource for Rows {
    fn write_snapshot(&self, builder: &mut FingerprintBuilder) {
        let rows = self.0.lock().unwrap();
        builder.collection("rows", rows.values());
    }
}

#[tokio::test(start_paused = true)]
async fn returning_to_delivered_state_skips_the_call() {
    let transport = Arc::new(MemoryTransport::new());
    let rows = Arc::new(Rows::default());
    let engine = SyncEngine::builder(transport.clone())
        .config(config())
        .snapshot_source(rows.clone())
        .start()
        .await
        .unwrap();

    rows.set("ana", json!({ "name": "Ana", "present": true }));
    engine.notify_change(json!({ "add": "ana" })).await.unwrap();
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 1);

    // Add and remove a row inside one debounce window.
    rows.set("ben", json!({ "name": "Ben", "present": false }));
    engine.notify_change(json!({ "add": "ben" })).await.unwrap();
    rows.remove("ben");
    engine.notify_change(json!({ "remove": "ben" })).await.unwrap();

    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 1);
    assert_eq!(engine.status().phase, SyncPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn edit_in_place_is_still_sent() {
    let transport = Arc::new(MemoryTransport::new());
    let rows = Arc::new(Rows::default());
    let engine = SyncEngine::builder(transport.clone())
        .config(config())
        .snapshot_source(rows.clone())
        .start()
        .await
        .unwrap();

    rows.set("ana", json!({ "present": true }));
    engine.notify_change(json!({ "add": "ana" })).await.unwrap();
    wait_for(&engine, |s| s.pending == 0).await;

    // Same row count, different content.
    rows.set("ana", json!({ "present": false }));
    engine.notify_change(json!({ "edit": "ana" })).await.unwrap();
    wait_for(&engine, |s| s.pending == 0).await;

    assert_eq!(transport.send_count(), 2);
    let batches = transport.accepted_batches();
    assert_ne!(batches[0].fingerprint, batches[1].fingerprint);
}

#[tokio::test(start_paused = true)]
async fn disabling_sync_keeps_changes_queued() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = start(&transport, config()).await;

    engine.set_sync_enabled(false).await.unwrap();
    engine.notify_change(json!(1)).await.unwrap();
    engine.notify_change(json!(2)).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.send_count(), 0);
    assert_eq!(engine.status().pending, 2);
    assert_eq!(engine.status().phase, SyncPhase::Idle);

    engine.set_sync_enabled(true).await.unwrap();
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.accepted_batches()[0].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn changes_wait_for_a_target() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = config();
    config.target = None;
    let engine = start(&transport, config).await;

    engine.notify_change(json!("early")).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.send_count(), 0);

    engine
        .set_sync_target(Some(TargetId::new("attendance").unwrap()))
        .await
        .unwrap();
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sync_now_reports_failure() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next(1, FailureKind::Network);
    let engine = start(&transport, config()).await;

    engine.notify_change(json!("x")).await.unwrap();
    let outcome = engine.sync_now().await.unwrap();

    match outcome {
        SyncOutcome::Failed { transient, .. } => assert!(transient),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(engine.status().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn probe_loop_drives_connectivity() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_reachable(false);
    let engine = start(
        &transport,
        config().with_probe_interval(Duration::from_millis(250)),
    )
    .await;

    wait_for(&engine, |s| !s.connectivity.is_online()).await;
    engine.notify_change(json!("queued offline")).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.send_count(), 0);

    transport.set_reachable(true);
    wait_for(&engine, |s| s.pending == 0).await;
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn queue_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.json");
    let transport = Arc::new(MemoryTransport::new());

    {
        let engine = start(
            &transport,
            config().with_state_path(&path).with_start_online(false),
        )
        .await;
        for i in 0..3 {
            engine.notify_change(json!({ "row": i })).await.unwrap();
        }
        engine.shutdown().await.unwrap();
    }
    assert_eq!(transport.send_count(), 0);

    let engine = start(&transport, config().with_state_path(&path)).await;
    assert_eq!(engine.status().pending, 3);

    let next = engine.notify_change(json!({ "row": 3 })).await.unwrap();
    assert_eq!(next, SequenceNumber::new(4));

    wait_for(&engine, |s| s.pending == 0).await;
    let sequences: Vec<u64> = transport
        .applied_records()
        .iter()
        .map(|r| r.sequence.get())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn failed_acknowledgement_write_is_reported() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("state");
    let transport = Arc::new(MemoryTransport::new());
    let engine = start(
        &transport,
        config()
            .with_state_path(dir.join("queue.json"))
            .with_start_online(false),
    )
    .await;

    engine.notify_change(json!({ "row": 1 })).await.unwrap();
    engine.notify_change(json!({ "row": 2 })).await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    engine.connectivity().report_online();
    wait_for(&engine, |s| s.pending == 0).await;

    assert_eq!(transport.applied_records().len(), 2);
    let status = engine.status();
    assert!(status.last_error.unwrap().starts_with("I/O error"));
    assert!(status.last_synced_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_call() {
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(300)));
    let engine = start(&transport, config()).await;

    engine.notify_change(json!("last words")).await.unwrap();
    wait_for(&engine, |s| s.syncing).await;

    engine.shutdown().await.unwrap();
    assert_eq!(transport.applied_records().len(), 1);
}
