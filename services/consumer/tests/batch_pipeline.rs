//! Batch pipeline properties: dedup idempotence, batch atomicity,
//! validation dead-lettering.

use chrono::{TimeZone, Utc};
use consumer::dedup::DedupCache;
use consumer::store::{MemoryTelemetryStore, TelemetryStore};
use consumer::worker::{BatchProcessor, Disposition};
use consumer::{ConsumerMetrics, QueueKind};
use fleet_proto::{NetworkType, Position, TelemetryRecord};
use std::sync::Arc;

fn record(seq: u64, fingerprint: &str) -> TelemetryRecord {
    TelemetryRecord {
        identity: "123456789012345".parse().unwrap(),
        sequence: seq,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(seq as i64),
        timestamp_valid: true,
        position: Position {
            latitude: 12.9716,
            longitude: 77.5946,
            altitude: 900,
            heading: 180,
            speed: 42,
            satellites: 10,
        },
        io: std::collections::BTreeMap::new(),
        ignition: true,
        mileage_m: Some(1000),
        network: NetworkType::Lte,
        fingerprint: fingerprint.to_owned(),
    }
}

fn payloads(records: &[TelemetryRecord]) -> Vec<Vec<u8>> {
    records
        .iter()
        .map(|r| serde_json::to_vec(r).unwrap())
        .collect()
}

fn processor(store: Arc<MemoryTelemetryStore>) -> BatchProcessor {
    let mut p = BatchProcessor::new(
        QueueKind::Telemetry,
        store,
        1024,
        ConsumerMetrics::new(),
    );
    p.max_write_attempts = 2;
    p
}

#[tokio::test]
async fn dedup_replay_produces_single_rows() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let mut processor = processor(Arc::clone(&store));

    let records: Vec<_> = (0..10).map(|i| record(i, &format!("f{i:04}"))).collect();
    let bytes = payloads(&records);
    let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();

    // First pass: everything inserted.
    let outcome = processor.process(&refs).await;
    assert!(outcome.committed);
    assert!(outcome
        .dispositions
        .iter()
        .all(|d| *d == Disposition::Inserted));
    assert_eq!(store.row_count(QueueKind::Telemetry), 10);

    // Replay: ten rows stay ten rows, ten drops counted.
    let outcome = processor.process(&refs).await;
    assert!(outcome.committed);
    assert!(outcome
        .dispositions
        .iter()
        .all(|d| *d == Disposition::DuplicateDropped));
    assert_eq!(store.row_count(QueueKind::Telemetry), 10);
    let dropped = processor
        .metrics
        .dedup_dropped_total
        .with_label_values(&["telemetry_queue", "l1"])
        .get();
    assert_eq!(dropped, 10);
}

#[tokio::test]
async fn replay_after_restart_hits_l2() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let records: Vec<_> = (0..5).map(|i| record(i, &format!("g{i:04}"))).collect();
    let bytes = payloads(&records);
    let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();

    let mut first = processor(Arc::clone(&store));
    assert!(first.process(&refs).await.committed);

    // A fresh processor models a restarted worker: empty L1, same DB.
    let mut second = processor(Arc::clone(&store));
    let outcome = second.process(&refs).await;
    assert!(outcome.committed);
    assert!(outcome
        .dispositions
        .iter()
        .all(|d| *d == Disposition::DuplicateDropped));
    assert_eq!(store.row_count(QueueKind::Telemetry), 5);
    let l2_drops = second
        .metrics
        .dedup_dropped_total
        .with_label_values(&["telemetry_queue", "l2"])
        .get();
    assert_eq!(l2_drops, 5);
}

#[tokio::test]
async fn failed_write_fails_the_whole_batch() {
    let store = Arc::new(MemoryTelemetryStore::new());
    store.set_failing(true);
    let mut processor = processor(Arc::clone(&store));

    let records: Vec<_> = (0..3).map(|i| record(i, &format!("h{i:04}"))).collect();
    let bytes = payloads(&records);
    let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();

    let outcome = processor.process(&refs).await;
    assert!(!outcome.committed);
    assert!(outcome.dispositions.iter().all(|d| matches!(
        d,
        Disposition::DeadLetter {
            reason: "db_write_failure",
            ..
        }
    )));
    assert_eq!(store.row_count(QueueKind::Telemetry), 0);

    // Redelivery after recovery applies cleanly: L1 was not poisoned by
    // the failed attempt.
    store.set_failing(false);
    let outcome = processor.process(&refs).await;
    assert!(outcome.committed);
    assert_eq!(store.row_count(QueueKind::Telemetry), 3);
}

#[tokio::test]
async fn validation_failures_are_dead_lettered_not_written() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let mut processor = processor(Arc::clone(&store));

    let good = record(1, "ok01");
    let mut bad_position = record(2, "bad1");
    bad_position.position.latitude = 95.0;
    let mut bad_clock = record(3, "bad2");
    bad_clock.timestamp_valid = false;

    let bytes = payloads(&[good, bad_position, bad_clock]);
    let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();
    let outcome = processor.process(&refs).await;

    assert!(outcome.committed);
    assert_eq!(outcome.dispositions[0], Disposition::Inserted);
    assert_eq!(
        outcome.dispositions[1],
        Disposition::DeadLetter {
            reason: "position_out_of_range",
            field: Some("latitude"),
        }
    );
    assert_eq!(
        outcome.dispositions[2],
        Disposition::DeadLetter {
            reason: "timestamp_out_of_range",
            field: Some("timestamp"),
        }
    );
    assert_eq!(store.row_count(QueueKind::Telemetry), 1);
}

#[tokio::test]
async fn undecodable_payload_is_dead_lettered() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let mut processor = processor(Arc::clone(&store));

    let good = payloads(&[record(1, "ok02")]);
    let outcome = processor
        .process(&[b"not json at all", good[0].as_slice()])
        .await;

    assert!(outcome.committed);
    assert_eq!(
        outcome.dispositions[0],
        Disposition::DeadLetter {
            reason: "decode_failure",
            field: None,
        }
    );
    assert_eq!(outcome.dispositions[1], Disposition::Inserted);
}

#[tokio::test]
async fn intra_batch_duplicates_collapse() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let mut processor = processor(Arc::clone(&store));

    let one = record(1, "dup1");
    let bytes = payloads(&[one.clone(), one.clone(), one]);
    let refs: Vec<&[u8]> = bytes.iter().map(Vec::as_slice).collect();
    let outcome = processor.process(&refs).await;

    assert!(outcome.committed);
    assert_eq!(outcome.dispositions[0], Disposition::Inserted);
    assert_eq!(outcome.dispositions[1], Disposition::DuplicateDropped);
    assert_eq!(outcome.dispositions[2], Disposition::DuplicateDropped);
    assert_eq!(store.row_count(QueueKind::Telemetry), 1);
}

#[test]
fn dedup_cache_stays_bounded_under_load() {
    let mut cache = DedupCache::new(1000);
    for i in 0..10_000 {
        cache.insert(format!("key-{i}"));
    }
    assert_eq!(cache.len(), 1000);
}
