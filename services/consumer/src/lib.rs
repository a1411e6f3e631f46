//! Persistence consumer.
//!
//! Consumes the telemetry, alarm, and event queues; batches, deduplicates,
//! validates, and writes records to Postgres with at-least-once delivery.
//! A batch's broker deliveries are acked together exactly when its
//! transaction commits; redelivery after a crash is made safe by the
//! dedup path.

pub mod batch;
pub mod config;
pub mod dedup;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod validate;
pub mod worker;

pub use config::ConsumerConfig;
pub use metrics::ConsumerMetrics;
pub use queue::QueueKind;
