//! Calculator registry.
//!
//! A calculator is a named, versioned unit invoked once per record with
//! the enrichment context. It either updates per-device state and returns
//! metric events, or declares the record a rule violation and returns a
//! violation event. Versions are monotonically increasing; a bump
//! invalidates previously computed violations via the recalculation queue.

pub mod distance;
pub mod idle;
pub mod overspeed;

use crate::enrich::DeviceConfig;
use chrono::{DateTime, Utc};
use fleet_proto::{Identity, TelemetryRecord};

/// A derived metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub identity: Identity,
    pub name: &'static str,
    pub value: f64,
    pub at: DateTime<Utc>,
}

/// A completed rule violation.
///
/// Violations are emitted when they close (the device drops back under
/// the rule threshold); open violations live only in calculator state.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationEvent {
    pub identity: Identity,
    pub rule: &'static str,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Rule-dependent magnitude: peak speed, idle seconds, metres.
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalcEvent {
    Metric(MetricEvent),
    Violation(ViolationEvent),
}

pub trait Calculator: Send {
    fn name(&self) -> &'static str;
    /// Monotonically increasing formula version.
    fn version(&self) -> u32;
    fn process(&mut self, record: &TelemetryRecord, config: &DeviceConfig) -> Vec<CalcEvent>;
}

/// The full production registry. Recalculation builds a fresh one so
/// replayed history starts from clean state.
pub fn build_registry() -> Vec<Box<dyn Calculator>> {
    vec![
        Box::new(distance::DistanceCalculator::new()),
        Box::new(overspeed::OverspeedCalculator::new()),
        Box::new(idle::IdleCalculator::new()),
    ]
}

/// Only the violation-producing calculators, for recomputation jobs.
pub fn build_violation_registry() -> Vec<Box<dyn Calculator>> {
    vec![
        Box::new(overspeed::OverspeedCalculator::new()),
        Box::new(idle::IdleCalculator::new()),
    ]
}

/// (name, version) pairs of the current registry, for the catalog.
pub fn registry_versions() -> Vec<(&'static str, u32)> {
    build_registry()
        .iter()
        .map(|c| (c.name(), c.version()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let versions = registry_versions();
        let mut names: Vec<_> = versions.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), versions.len());
    }
}
