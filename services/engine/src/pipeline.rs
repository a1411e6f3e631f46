//! The per-record calculation pipeline: enrichment, calculator fan-out,
//! pending-writes buffering, transactional flush.
//!
//! Shadow mode runs every calculator and logs what would be written, but
//! suppresses the buffer entirely: no database writes, no outbound
//! alarms. It is the first-class rollout mode for new formulas.

use crate::calculators::{CalcEvent, Calculator};
use crate::enrich::EnrichmentCache;
use crate::metrics::EngineMetrics;
use crate::pending::PendingWrites;
use crate::store::EngineStore;
use fleet_proto::TelemetryRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct Pipeline {
    calculators: Vec<Box<dyn Calculator>>,
    enrichment: EnrichmentCache,
    pending: PendingWrites,
    shadow_mode: bool,
    metrics: Arc<EngineMetrics>,
    max_write_attempts: u32,
}

impl Pipeline {
    pub fn new(
        calculators: Vec<Box<dyn Calculator>>,
        enrichment: EnrichmentCache,
        shadow_mode: bool,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        metrics.shadow_mode.set(i64::from(shadow_mode));
        Pipeline {
            calculators,
            enrichment,
            pending: PendingWrites::new(),
            shadow_mode,
            metrics,
            max_write_attempts: 5,
        }
    }

    /// Invalidate cached enrichment, e.g. after a catalog reload.
    pub fn invalidate_enrichment(&mut self) {
        self.enrichment.invalidate();
    }

    /// Cap flush retries; tests shrink this to keep failure paths fast.
    pub fn set_max_write_attempts(&mut self, attempts: u32) {
        self.max_write_attempts = attempts.max(1);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Run one record through every calculator, buffering side effects
    /// (or logging them in shadow mode).
    pub async fn handle_record(&mut self, record: &TelemetryRecord) {
        let config = self.enrichment.get(&record.identity).await;

        for calculator in &mut self.calculators {
            let name = calculator.name();
            self.metrics
                .calculator_invocations_total
                .with_label_values(&[name])
                .inc();
            let timer = self
                .metrics
                .calculator_seconds
                .with_label_values(&[name])
                .start_timer();
            let events = calculator.process(record, &config);
            timer.observe_duration();

            for event in events {
                if let CalcEvent::Violation(v) = &event {
                    self.metrics
                        .violations_total
                        .with_label_values(&[v.rule])
                        .inc();
                }
                if self.shadow_mode {
                    match &event {
                        CalcEvent::Metric(m) => info!(
                            shadow = true,
                            identity = %m.identity,
                            metric = m.name,
                            value = m.value,
                            "metric suppressed"
                        ),
                        CalcEvent::Violation(v) => info!(
                            shadow = true,
                            identity = %v.identity,
                            rule = v.rule,
                            value = v.value,
                            "violation suppressed"
                        ),
                    }
                } else {
                    self.pending.push(event);
                }
            }
        }
        self.metrics.pending_writes_depth.set(self.pending.len() as i64);
    }

    /// Flush the buffer in one transaction with capped retries. Returns
    /// whether the flush committed; on permanent failure the buffer is
    /// dropped and the caller dead-letters the batch.
    pub async fn flush(&mut self, store: &dyn EngineStore) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let (metrics_events, violations) = self.pending.take();
        self.metrics.pending_writes_depth.set(0);

        let mut delay = Duration::from_millis(500);
        for attempt in 1..=self.max_write_attempts {
            let timer = self
                .metrics
                .batch_write_seconds
                .with_label_values(&["engine"])
                .start_timer();
            match store.write_batch(&metrics_events, &violations).await {
                Ok(()) => {
                    timer.observe_duration();
                    return true;
                }
                Err(e) => {
                    drop(timer);
                    if !e.is_transient() || attempt == self.max_write_attempts {
                        error!(attempt, error = %e, "pending-writes flush failed permanently");
                        return false;
                    }
                    warn!(attempt, error = %e, "pending-writes flush failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        false
    }
}
