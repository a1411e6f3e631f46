//! Prometheus metrics for the consumer service.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

pub struct ConsumerMetrics {
    pub registry: Arc<Registry>,
    pub messages_processed_total: IntCounterVec,
    pub messages_failed_total: IntCounterVec,
    pub dedup_dropped_total: IntCounterVec,
    pub validation_failures_total: IntCounterVec,
    pub dlq_messages_total: IntCounterVec,
    pub db_write_failures_total: IntCounterVec,
    pub batch_write_seconds: HistogramVec,
    pub connection_connected: IntGaugeVec,
    pub breaker_state: IntGaugeVec,
}

impl ConsumerMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry::new());

        let messages_processed_total = IntCounterVec::new(
            Opts::new(
                "consumer_service_messages_processed_total",
                "Messages processed successfully",
            ),
            &["queue"],
        )
        .expect("metric definition is static");
        let messages_failed_total = IntCounterVec::new(
            Opts::new(
                "consumer_service_messages_failed_total",
                "Messages that failed processing",
            ),
            &["queue"],
        )
        .expect("metric definition is static");
        let dedup_dropped_total = IntCounterVec::new(
            Opts::new(
                "consumer_dedup_dropped_total",
                "Records dropped as duplicates",
            ),
            &["queue", "level"],
        )
        .expect("metric definition is static");
        let validation_failures_total = IntCounterVec::new(
            Opts::new(
                "consumer_validation_failures_total",
                "Validation failures by field and reason",
            ),
            &["field", "reason"],
        )
        .expect("metric definition is static");
        let dlq_messages_total = IntCounterVec::new(
            Opts::new(
                "consumer_dlq_messages_total",
                "Messages routed to the dead-letter queue",
            ),
            &["queue", "reason"],
        )
        .expect("metric definition is static");
        let db_write_failures_total = IntCounterVec::new(
            Opts::new(
                "consumer_db_write_failures_total",
                "Database write failures by table",
            ),
            &["table"],
        )
        .expect("metric definition is static");
        let batch_write_seconds = HistogramVec::new(
            HistogramOpts::new("consumer_batch_write_seconds", "Batch write latency")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["table"],
        )
        .expect("metric definition is static");
        let connection_connected = IntGaugeVec::new(
            Opts::new(
                "consumer_service_connection_connected",
                "1 when the queue consumer is attached to the broker",
            ),
            &["queue"],
        )
        .expect("metric definition is static");
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "consumer_breaker_state",
                "Circuit breaker state: 0 closed, 1 open, 2 half-open",
            ),
            &["dependency"],
        )
        .expect("metric definition is static");

        for metric in [
            Box::new(messages_processed_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_failed_total.clone()),
            Box::new(dedup_dropped_total.clone()),
            Box::new(validation_failures_total.clone()),
            Box::new(dlq_messages_total.clone()),
            Box::new(db_write_failures_total.clone()),
            Box::new(batch_write_seconds.clone()),
            Box::new(connection_connected.clone()),
            Box::new(breaker_state.clone()),
        ] {
            registry
                .register(metric)
                .expect("consumer metrics registered once");
        }

        Arc::new(ConsumerMetrics {
            registry,
            messages_processed_total,
            messages_failed_total,
            dedup_dropped_total,
            validation_failures_total,
            dlq_messages_total,
            db_write_failures_total,
            batch_write_seconds,
            connection_connected,
            breaker_state,
        })
    }
}
