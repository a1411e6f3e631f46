//! Overspeed violation: speed above the device's configured limit.
//!
//! State machine per device: a violation opens on the first record over
//! the limit and closes on the first record back under it, emitting one
//! violation event carrying the window and the peak speed.

use super::{CalcEvent, Calculator, ViolationEvent};
use crate::enrich::DeviceConfig;
use chrono::{DateTime, Utc};
use fleet_proto::{Identity, TelemetryRecord};
use std::collections::HashMap;

struct Episode {
    started_at: DateTime<Utc>,
    peak_kph: u16,
}

pub struct OverspeedCalculator {
    active: HashMap<Identity, Episode>,
}

impl OverspeedCalculator {
    pub fn new() -> Self {
        OverspeedCalculator {
            active: HashMap::new(),
        }
    }
}

impl Default for OverspeedCalculator {
    fn default() -> Self {
        OverspeedCalculator::new()
    }
}

impl Calculator for OverspeedCalculator {
    fn name(&self) -> &'static str {
        "overspeed"
    }

    fn version(&self) -> u32 {
        3
    }

    fn process(&mut self, record: &TelemetryRecord, config: &DeviceConfig) -> Vec<CalcEvent> {
        let speed = record.position.speed;

        if speed > config.speed_limit_kph {
            let episode = self
                .active
                .entry(record.identity.clone())
                .or_insert(Episode {
                    started_at: record.timestamp,
                    peak_kph: speed,
                });
            episode.peak_kph = episode.peak_kph.max(speed);
            return Vec::new();
        }

        match self.active.remove(&record.identity) {
            Some(episode) => vec![CalcEvent::Violation(ViolationEvent {
                identity: record.identity.clone(),
                rule: "overspeed",
                started_at: episode.started_at,
                ended_at: record.timestamp,
                value: f64::from(episode.peak_kph),
            })],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_proto::{NetworkType, Position};

    fn record(speed: u16, secs: i64) -> TelemetryRecord {
        TelemetryRecord {
            identity: "123456789012345".parse().unwrap(),
            sequence: secs as u64,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            timestamp_valid: true,
            position: Position {
                latitude: 12.97,
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

    fn config(limit: u16) -> DeviceConfig {
        DeviceConfig {
            speed_limit_kph: limit,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn violation_spans_the_over_limit_window() {
        let mut calc = OverspeedCalculator::new();
        let cfg = config(80);

        assert!(calc.process(&record(70, 0), &cfg).is_empty());
        assert!(calc.process(&record(95, 10), &cfg).is_empty());
        assert!(calc.process(&record(110, 20), &cfg).is_empty());
        let events = calc.process(&record(60, 30), &cfg);

        assert_eq!(events.len(), 1);
        let CalcEvent::Violation(v) = &events[0] else {
            panic!("expected violation");
        };
        assert_eq!(v.rule, "overspeed");
        assert_eq!(
            v.started_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap()
        );
        assert_eq!(
            v.ended_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap()
        );
        assert!((v.value - 110.0).abs() < f64::EPSILON);
    }

    #[test]
    fn speed_at_limit_is_not_a_violation() {
        let mut calc = OverspeedCalculator::new();
        let cfg = config(80);
        assert!(calc.process(&record(80, 0), &cfg).is_empty());
        assert!(calc.process(&record(79, 10), &cfg).is_empty());
    }

    #[test]
    fn devices_are_tracked_independently() {
        let mut calc = OverspeedCalculator::new();
        let cfg = config(80);
        let mut other = record(95, 0);
        other.identity = "999999999999999".parse().unwrap();

        calc.process(&record(95, 0), &cfg);
        calc.process(&other, &cfg);
        let events = calc.process(&record(50, 10), &cfg);
        // Only the first device's episode closed.
        assert_eq!(events.len(), 1);
    }
}
