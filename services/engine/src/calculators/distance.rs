//! Distance calculator: per-record travelled distance from consecutive
//! GPS fixes, cross-checked against the device odometer when present.

use super::{CalcEvent, Calculator, MetricEvent};
use crate::enrich::DeviceConfig;
use chrono::{DateTime, Utc};
use fleet_proto::{Identity, TelemetryRecord};
use std::collections::HashMap;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

struct LastFix {
    latitude: f64,
    longitude: f64,
    at: DateTime<Utc>,
    odometer_m: Option<u64>,
}

pub struct DistanceCalculator {
    last: HashMap<Identity, LastFix>,
}

impl DistanceCalculator {
    pub fn new() -> Self {
        DistanceCalculator {
            last: HashMap::new(),
        }
    }
}

impl Default for DistanceCalculator {
    fn default() -> Self {
        DistanceCalculator::new()
    }
}

impl Calculator for DistanceCalculator {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn version(&self) -> u32 {
        2
    }

    fn process(&mut self, record: &TelemetryRecord, _config: &DeviceConfig) -> Vec<CalcEvent> {
        let mut events = Vec::new();
        let position = &record.position;

        if let Some(last) = self.last.get(&record.identity) {
            // Out-of-order delivery: skip, keep the newer fix as anchor.
            if record.timestamp > last.at {
                let gps_m = haversine_m(
                    last.latitude,
                    last.longitude,
                    position.latitude,
                    position.longitude,
                );
                events.push(CalcEvent::Metric(MetricEvent {
                    identity: record.identity.clone(),
                    name: "distance_m",
                    value: gps_m,
                    at: record.timestamp,
                }));

                // Odometer delta when both samples carry one; large
                // disagreement with GPS hints at a wedged receiver.
                if let (Some(prev), Some(curr)) = (last.odometer_m, record.mileage_m) {
                    if curr >= prev {
                        events.push(CalcEvent::Metric(MetricEvent {
                            identity: record.identity.clone(),
                            name: "odometer_delta_m",
                            value: (curr - prev) as f64,
                            at: record.timestamp,
                        }));
                    }
                }
            }
        }

        let entry = self.last.entry(record.identity.clone()).or_insert(LastFix {
            latitude: position.latitude,
            longitude: position.longitude,
            at: record.timestamp,
            odometer_m: record.mileage_m,
        });
        if record.timestamp >= entry.at {
            *entry = LastFix {
                latitude: position.latitude,
                longitude: position.longitude,
                at: record.timestamp,
                odometer_m: record.mileage_m,
            };
        }

        events
    }
}
