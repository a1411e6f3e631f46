//! Prometheus metrics for the gateway.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

pub struct GatewayMetrics {
    pub registry: Arc<Registry>,
    pub connections_current: IntGauge,
    pub connections_total: IntCounter,
    pub disconnections_total: IntCounterVec,
    pub frames_total: IntCounter,
    pub records_total: IntCounter,
    pub records_no_fix_total: IntCounter,
    pub records_invalid_timestamp_total: IntCounter,
    pub publish_failures_total: IntCounter,
    pub staging_depth: IntGauge,
    pub commands_sent_total: IntCounter,
    pub responses_matched_total: IntCounter,
    pub responses_unmatched_total: IntCounter,
    pub publish_seconds: Histogram,
    pub breaker_state: IntGaugeVec,
}

impl GatewayMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry::new());

        let connections_current = IntGauge::new(
            "gateway_connections_current",
            "Currently registered device connections",
        )
        .expect("metric definition is static");
        let connections_total = IntCounter::new(
            "gateway_connections_total",
            "Device connections accepted since start",
        )
        .expect("metric definition is static");
        let disconnections_total = IntCounterVec::new(
            Opts::new(
                "gateway_disconnections_total",
                "Connections closed, by reason",
            ),
            &["reason"],
        )
        .expect("metric definition is static");
        let frames_total =
            IntCounter::new("gateway_frames_total", "Frames decoded across all connections")
                .expect("metric definition is static");
        let records_total = IntCounter::new(
            "gateway_records_total",
            "Telemetry records decoded and forwarded",
        )
        .expect("metric definition is static");
        let records_no_fix_total = IntCounter::new(
            "gateway_records_no_fix_total",
            "Records dropped for lacking a GPS fix",
        )
        .expect("metric definition is static");
        let records_invalid_timestamp_total = IntCounter::new(
            "gateway_records_invalid_timestamp_total",
            "Records whose device timestamp fell outside plausible bounds",
        )
        .expect("metric definition is static");
        let publish_failures_total = IntCounter::new(
            "gateway_publish_failures_total",
            "Broker publishes that exhausted retries",
        )
        .expect("metric definition is static");
        let staging_depth = IntGauge::new(
            "gateway_staging_depth",
            "Records waiting in the staging buffer",
        )
        .expect("metric definition is static");
        let commands_sent_total = IntCounter::new(
            "gateway_commands_sent_total",
            "Downlink commands written to device sockets",
        )
        .expect("metric definition is static");
        let responses_matched_total = IntCounter::new(
            "gateway_responses_matched_total",
            "Command responses matched to a sent command",
        )
        .expect("metric definition is static");
        let responses_unmatched_total = IntCounter::new(
            "gateway_responses_unmatched_total",
            "Unsolicited command responses recorded as received",
        )
        .expect("metric definition is static");
        let publish_seconds = Histogram::with_opts(
            HistogramOpts::new("gateway_publish_seconds", "Broker publish latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("metric definition is static");
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "gateway_breaker_state",
                "Circuit breaker state: 0 closed, 1 open, 2 half-open",
            ),
            &["dependency"],
        )
        .expect("metric definition is static");

        for metric in [
            Box::new(connections_current.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(connections_total.clone()),
            Box::new(disconnections_total.clone()),
            Box::new(frames_total.clone()),
            Box::new(records_total.clone()),
            Box::new(records_no_fix_total.clone()),
            Box::new(records_invalid_timestamp_total.clone()),
            Box::new(publish_failures_total.clone()),
            Box::new(staging_depth.clone()),
            Box::new(commands_sent_total.clone()),
            Box::new(responses_matched_total.clone()),
            Box::new(responses_unmatched_total.clone()),
            Box::new(publish_seconds.clone()),
            Box::new(breaker_state.clone()),
        ] {
            registry
                .register(metric)
                .expect("gateway metrics registered once");
        }

        Arc::new(GatewayMetrics {
            registry,
            connections_current,
            connections_total,
            disconnections_total,
            frames_total,
            records_total,
            records_no_fix_total,
            records_invalid_timestamp_total,
            publish_failures_total,
            staging_depth,
            commands_sent_total,
            responses_matched_total,
            responses_unmatched_total,
            publish_seconds,
            breaker_state,
        })
    }
}
