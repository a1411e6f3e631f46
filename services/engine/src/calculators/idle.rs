//! Idle violation: ignition on with zero speed beyond the configured
//! threshold. The violation closes when the vehicle moves or the ignition
//! goes off; the emitted value is the idle duration in seconds.

use super::{CalcEvent, Calculator, ViolationEvent};
use crate::enrich::DeviceConfig;
use chrono::{DateTime, Utc};
use fleet_proto::{Identity, TelemetryRecord};
use std::collections::HashMap;

pub struct IdleCalculator {
    idle_since: HashMap<Identity, DateTime<Utc>>,
}

impl IdleCalculator {
    pub fn new() -> Self {
        IdleCalculator {
            idle_since: HashMap::new(),
        }
    }
}

impl Default for IdleCalculator {
    fn default() -> Self {
        IdleCalculator::new()
    }
}

impl Calculator for IdleCalculator {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn version(&self) -> u32 {
        1
    }

    fn process(&mut self, record: &TelemetryRecord, config: &DeviceConfig) -> Vec<CalcEvent> {
        let idling = record.ignition && record.position.speed == 0;

        if idling {
            self.idle_since
                .entry(record.identity.clone())
                .or_insert(record.timestamp);
            return Vec::new();
        }

        match self.idle_since.remove(&record.identity) {
            Some(since) => {
                let idle = record.timestamp.signed_duration_since(since);
                let threshold =
                    chrono::Duration::from_std(config.idle_threshold).unwrap_or_else(|_| chrono::Duration::seconds(300));
                if idle >= threshold {
                    vec![CalcEvent::Violation(ViolationEvent {
                        identity: record.identity.clone(),
                        rule: "idle",
                        started_at: since,
                        ended_at: record.timestamp,
                        value: idle.num_seconds() as f64,
                    })]
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        }
    }
}
