//! Pipeline behaviour: fan-out, pending-writes flush, shadow mode.

use chrono::{TimeZone, Utc};
use engine::calculators::build_registry;
use engine::enrich::{ConfigSource, DeviceConfig, EnrichmentCache, MemoryConfigSource};
use engine::metrics::EngineMetrics;
use engine::pipeline::Pipeline;
use engine::store::MemoryEngineStore;
use fleet_proto::{Identity, NetworkType, Position, TelemetryRecord};
use std::sync::Arc;
use std::time::Duration;

fn identity() -> Identity {
    "123456789012345".parse().unwrap()
}

fn record(speed: u16, secs: i64) -> TelemetryRecord {
    TelemetryRecord {
        identity: identity(),
        sequence: secs as u64,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(secs),
        timestamp_valid: true,
        position: Position {
            latitude: 12.97 + secs as f64 * 1e-4,
            longitude: 77.59,
            altitude: 0,
            heading: 0,
            speed,
            satellites: 10,
        },
        io: std::collections::BTreeMap::new(),
        ignition: true,
        mileage_m: None,
        network: NetworkType::Lte,
        fingerprint: format!("fp{secs}"),
    }
}

fn pipeline(source: Arc<MemoryConfigSource>, shadow: bool) -> (Pipeline, Arc<EngineMetrics>) {
    let metrics = EngineMetrics::new();
    let enrichment = EnrichmentCache::new(
        source as Arc<dyn ConfigSource>,
        Duration::from_secs(60),
    );
    (
        Pipeline::new(build_registry(), enrichment, shadow, Arc::clone(&metrics)),
        metrics,
    )
}

#[tokio::test]
async fn overspeed_episode_lands_in_the_store() {
    let source = Arc::new(MemoryConfigSource::new());
    source.set(
        identity(),
        DeviceConfig {
            speed_limit_kph: 80,
            ..DeviceConfig::default()
        },
    );
    let (mut pipeline, metrics) = pipeline(source, false);
    let store = MemoryEngineStore::new();

    for (speed, secs) in [(70, 0), (95, 10), (110, 20), (60, 30)] {
        pipeline.handle_record(&record(speed, secs)).await;
    }
    assert!(pipeline.pending_len() > 0);
    assert!(pipeline.flush(&store).await);

    let violations = store.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, "overspeed");
    assert!((violations[0].value - 110.0).abs() < f64::EPSILON);
    // Distance metrics from consecutive fixes also flushed.
    assert!(store.metrics().iter().any(|m| m.name == "distance_m"));
    assert_eq!(
        metrics.violations_total.with_label_values(&["overspeed"]).get(),
        1
    );
    assert_eq!(pipeline.pending_len(), 0);
}

#[tokio::test]
async fn shadow_mode_suppresses_all_writes() {
    let source = Arc::new(MemoryConfigSource::new());
    source.set(
        identity(),
        DeviceConfig {
            speed_limit_kph: 80,
            ..DeviceConfig::default()
        },
    );
    let (mut pipeline, metrics) = pipeline(source, true);
    let store = MemoryEngineStore::new();

    for (speed, secs) in [(95, 0), (110, 10), (60, 20)] {
        pipeline.handle_record(&record(speed, secs)).await;
    }

    // Calculators ran (counters moved) but nothing was buffered.
    assert!(
        metrics
            .calculator_invocations_total
            .with_label_values(&["overspeed"])
            .get()
            > 0
    );
    assert_eq!(
        metrics.violations_total.with_label_values(&["overspeed"]).get(),
        1
    );
    assert_eq!(pipeline.pending_len(), 0);
    assert!(pipeline.flush(&store).await);
    assert!(store.violations().is_empty());
    assert!(store.metrics().is_empty());
    assert_eq!(metrics.shadow_mode.get(), 1);
}

#[tokio::test]
async fn failed_flush_reports_uncommitted() {
    let source = Arc::new(MemoryConfigSource::new());
    let (mut pipeline, _metrics) = pipeline(source, false);
    pipeline.set_max_write_attempts(2);
    let store = MemoryEngineStore::new();
    store.set_failing(true);

    pipeline.handle_record(&record(50, 0)).await;
    pipeline.handle_record(&record(55, 10)).await;
    assert!(pipeline.pending_len() > 0);
    assert!(!pipeline.flush(&store).await);
    assert!(store.metrics().is_empty());
}

#[tokio::test]
async fn speed_limit_comes_from_enrichment() {
    // Default limit is 80; this device is allowed 120.
    let source = Arc::new(MemoryConfigSource::new());
    source.set(
        identity(),
        DeviceConfig {
            speed_limit_kph: 120,
            ..DeviceConfig::default()
        },
    );
    let (mut pipeline, metrics) = pipeline(source, false);

    for (speed, secs) in [(100, 0), (110, 10), (60, 20)] {
        pipeline.handle_record(&record(speed, secs)).await;
    }
    assert_eq!(
        metrics.violations_total.with_label_values(&["overspeed"]).get(),
        0
    );
}
