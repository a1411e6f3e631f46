//! Pending-writes buffer: DB-bound side effects accumulated per batch and
//! flushed in one transaction.

use crate::calculators::{CalcEvent, MetricEvent, ViolationEvent};

#[derive(Default)]
pub struct PendingWrites {
    metrics: Vec<MetricEvent>,
    violations: Vec<ViolationEvent>,
}

impl PendingWrites {
    pub fn new() -> Self {
        PendingWrites::default()
    }

    pub fn push(&mut self, event: CalcEvent) {
        match event {
            CalcEvent::Metric(m) => self.metrics.push(m),
            CalcEvent::Violation(v) => self.violations.push(v),
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len() + self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.violations.is_empty()
    }

    /// Drain the buffer for a flush attempt. On flush failure the caller
    /// may push the contents back via `restore`.
    pub fn take(&mut self) -> (Vec<MetricEvent>, Vec<ViolationEvent>) {
        (
            std::mem::take(&mut self.metrics),
            std::mem::take(&mut self.violations),
        )
    }

    pub fn restore(&mut self, metrics: Vec<MetricEvent>, violations: Vec<ViolationEvent>) {
        self.metrics = metrics;
        self.violations = violations;
    }
}
