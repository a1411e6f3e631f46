//! Prometheus metrics for the metric engine.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

pub struct EngineMetrics {
    pub registry: Arc<Registry>,
    pub records_processed_total: IntCounterVec,
    pub records_failed_total: IntCounterVec,
    pub calculator_invocations_total: IntCounterVec,
    pub calculator_seconds: HistogramVec,
    pub violations_total: IntCounterVec,
    pub pending_writes_depth: IntGauge,
    pub shadow_mode: IntGauge,
    pub jobs_total: IntCounterVec,
    pub batch_write_seconds: HistogramVec,
    pub breaker_state: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry::new());

        let records_processed_total = IntCounterVec::new(
            Opts::new(
                "engine_records_processed_total",
                "Telemetry records run through the calculator pipeline",
            ),
            &["queue"],
        )
        .expect("metric definition is static");
        let records_failed_total = IntCounterVec::new(
            Opts::new("engine_records_failed_total", "Records that failed processing"),
            &["queue"],
        )
        .expect("metric definition is static");
        let calculator_invocations_total = IntCounterVec::new(
            Opts::new(
                "engine_calculator_invocations_total",
                "Calculator invocations",
            ),
            &["calculator"],
        )
        .expect("metric definition is static");
        let calculator_seconds = HistogramVec::new(
            HistogramOpts::new("engine_calculator_seconds", "Per-calculator duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]),
            &["calculator"],
        )
        .expect("metric definition is static");
        let violations_total = IntCounterVec::new(
            Opts::new("engine_violations_total", "Violations emitted, by rule"),
            &["rule"],
        )
        .expect("metric definition is static");
        let pending_writes_depth = IntGauge::new(
            "engine_pending_writes_depth",
            "Side effects buffered for the next flush",
        )
        .expect("metric definition is static");
        let shadow_mode = IntGauge::new(
            "engine_shadow_mode",
            "1 when calculators run without database writes",
        )
        .expect("metric definition is static");
        let jobs_total = IntCounterVec::new(
            Opts::new("engine_recalc_jobs_total", "Recalculation jobs, by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("metric definition is static");
        let batch_write_seconds = HistogramVec::new(
            HistogramOpts::new("engine_batch_write_seconds", "Pending-writes flush latency")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["table"],
        )
        .expect("metric definition is static");
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "engine_breaker_state",
                "Circuit breaker state: 0 closed, 1 open, 2 half-open",
            ),
            &["dependency"],
        )
        .expect("metric definition is static");

        for metric in [
            Box::new(records_processed_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(records_failed_total.clone()),
            Box::new(calculator_invocations_total.clone()),
            Box::new(calculator_seconds.clone()),
            Box::new(violations_total.clone()),
            Box::new(pending_writes_depth.clone()),
            Box::new(shadow_mode.clone()),
            Box::new(jobs_total.clone()),
            Box::new(batch_write_seconds.clone()),
            Box::new(breaker_state.clone()),
        ] {
            registry
                .register(metric)
                .expect("engine metrics registered once");
        }

        Arc::new(EngineMetrics {
            registry,
            records_processed_total,
            records_failed_total,
            calculator_invocations_total,
            calculator_seconds,
            violations_total,
            pending_writes_depth,
            shadow_mode,
            jobs_total,
            batch_write_seconds,
            breaker_state,
        })
    }
}
