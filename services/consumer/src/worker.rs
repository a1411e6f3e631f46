//! The consumer worker: batch processing core plus the broker-facing loop.
//!
//! [`BatchProcessor::process`] is the atomicity unit: decode, dedup,
//! validate, write: and is exercised directly by the tests. The delivery
//! loop around it maps each record's disposition onto the broker protocol:
//! ack on commit, ack after explicit dead-lettering, nack-requeue-off when
//! the write failed persistently.

use crate::batch::BatchAccumulator;
use crate::dedup::DedupCache;
use crate::metrics::ConsumerMetrics;
use crate::queue::QueueKind;
use crate::store::TelemetryStore;
use crate::validate::validate;
use fleet_infra::breaker::CircuitBreaker;
use fleet_infra::broker::{open_consumer, publish_dead_letter, BrokerError};
use fleet_infra::config::BrokerConfig;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to one record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Inserted,
    DuplicateDropped,
    DeadLetter {
        reason: &'static str,
        field: Option<&'static str>,
    },
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// Parallel to the input payloads.
    pub dispositions: Vec<Disposition>,
    /// False when the database write failed past the retry cap; inserted
    /// records of this batch must be redelivered or dead-lettered.
    pub committed: bool,
}

pub struct BatchProcessor {
    pub queue: QueueKind,
    pub store: Arc<dyn TelemetryStore>,
    pub dedup: DedupCache,
    pub metrics: Arc<ConsumerMetrics>,
    pub max_write_attempts: u32,
}

impl BatchProcessor {
    pub fn new(
        queue: QueueKind,
        store: Arc<dyn TelemetryStore>,
        dedup_capacity: usize,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        BatchProcessor {
            queue,
            store,
            dedup: DedupCache::new(dedup_capacity),
            metrics,
            max_write_attempts: 5,
        }
    }

    /// Run one batch through dedup → validation → write.
    pub async fn process(&mut self, payloads: &[&[u8]]) -> BatchOutcome {
        let queue_label = self.queue.queue_name();
        let mut dispositions = vec![Disposition::DuplicateDropped; payloads.len()];
        let mut decoded = Vec::with_capacity(payloads.len());

        for (index, payload) in payloads.iter().enumerate() {
            match self.queue.decode(payload) {
                Ok(stored) => decoded.push((index, stored)),
                Err(e) => {
                    debug!(queue = queue_label, error = %e, "payload decode failed");
                    dispositions[index] = Disposition::DeadLetter {
                        reason: "decode_failure",
                        field: None,
                    };
                }
            }
        }

        // Dedup pass. L1 first (includes intra-batch duplicates), then one
        // L2 lookup for the survivors.
        let mut survivors = Vec::with_capacity(decoded.len());
        let mut l2_candidates = Vec::new();
        let mut batch_seen = std::collections::HashSet::new();
        for (index, stored) in decoded {
            let key = stored.record.dedup_key();
            if self.dedup.contains(&key) || !batch_seen.insert(key.clone()) {
                self.metrics
                    .dedup_dropped_total
                    .with_label_values(&[queue_label, "l1"])
                    .inc();
                continue;
            }
            l2_candidates.push(key.clone());
            survivors.push((index, key, stored));
        }

        let existing = if l2_candidates.is_empty() {
            std::collections::HashSet::new()
        } else {
            match self.store.filter_existing(self.queue, &l2_candidates).await {
                Ok(existing) => existing,
                Err(e) => {
                    // L2 unavailable: proceed without it; the unique index
                    // on write still guarantees idempotence.
                    warn!(queue = queue_label, error = %e, "L2 dedup lookup failed");
                    std::collections::HashSet::new()
                }
            }
        };

        let mut fresh = Vec::with_capacity(survivors.len());
        for (index, key, stored) in survivors {
            if existing.contains(&key) {
                self.metrics
                    .dedup_dropped_total
                    .with_label_values(&[queue_label, "l2"])
                    .inc();
                // L2 hits warm the L1 so the next replay is cheaper.
                self.dedup.insert(key);
                continue;
            }
            match validate(&stored) {
                Ok(()) => fresh.push((index, key, stored)),
                Err(failure) => {
                    self.metrics
                        .validation_failures_total
                        .with_label_values(&[failure.field, failure.reason])
                        .inc();
                    dispositions[index] = Disposition::DeadLetter {
                        reason: failure.reason,
                        field: Some(failure.field),
                    };
                }
            }
        }

        if fresh.is_empty() {
            return BatchOutcome {
                dispositions,
                committed: true,
            };
        }

        let records: Vec<_> = fresh.iter().map(|(_, _, stored)| stored.clone()).collect();
        let committed = self.write_with_retry(&records).await;
        if committed {
            for (index, key, _) in fresh {
                self.dedup.insert(key);
                dispositions[index] = Disposition::Inserted;
            }
        } else {
            for (index, _, _) in fresh {
                dispositions[index] = Disposition::DeadLetter {
                    reason: "db_write_failure",
                    field: None,
                };
            }
        }

        BatchOutcome {
            dispositions,
            committed,
        }
    }

    async fn write_with_retry(&self, records: &[crate::queue::StoredRecord]) -> bool {
        let table = self.queue.target_table();
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=self.max_write_attempts {
            let timer = self
                .metrics
                .batch_write_seconds
                .with_label_values(&[table])
                .start_timer();
            match self.store.insert_batch(self.queue, records).await {
                Ok(()) => {
                    timer.observe_duration();
                    return true;
                }
                Err(e) => {
                    drop(timer);
                    self.metrics
                        .db_write_failures_total
                        .with_label_values(&[table])
                        .inc();
                    if !e.is_transient() || attempt == self.max_write_attempts {
                        error!(table, attempt, error = %e, "batch write failed permanently");
                        return false;
                    }
                    warn!(table, attempt, error = %e, "batch write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Broker-facing loop
// ---------------------------------------------------------------------------

pub struct WorkerConfig {
    pub queue: QueueKind,
    pub worker_id: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub prefetch: u16,
}

/// Consume one queue until shutdown, reconnecting with backoff on broker
/// failures. Never lets an error unwind past the loop boundary.
pub async fn run_worker(
    cfg: WorkerConfig,
    broker_cfg: BrokerConfig,
    mut processor: BatchProcessor,
    breaker: Arc<CircuitBreaker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue_name = cfg.queue.queue_name();
    let consumer_tag = format!("{queue_name}-worker-{}", cfg.worker_id);
    let mut reconnect_delay = Duration::from_millis(500);

    while !*shutdown.borrow() {
        let consumer = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            consumer = open_consumer(&broker_cfg, queue_name, cfg.prefetch, &consumer_tag) => consumer,
        };
        let mut consumer = match consumer {
            Ok(consumer) => {
                info!(queue = queue_name, tag = %consumer_tag, "consumer attached");
                processor
                    .metrics
                    .connection_connected
                    .with_label_values(&[queue_name])
                    .set(1);
                reconnect_delay = Duration::from_millis(500);
                consumer
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "consumer connect failed, backing off");
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
                continue;
            }
        };

        let result = consume_loop(&cfg, &mut consumer, &mut processor, &breaker, &mut shutdown).await;
        processor
            .metrics
            .connection_connected
            .with_label_values(&[queue_name])
            .set(0);
        match result {
            Ok(()) => break, // clean shutdown
            Err(e) => {
                warn!(queue = queue_name, error = %e, "consume loop failed, reconnecting");
            }
        }
    }
    info!(queue = queue_name, tag = %consumer_tag, "worker stopped");
}

async fn consume_loop(
    cfg: &WorkerConfig,
    consumer: &mut fleet_infra::broker::QueueConsumer,
    processor: &mut BatchProcessor,
    breaker: &CircuitBreaker,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut batch: BatchAccumulator<Delivery> =
        BatchAccumulator::new(cfg.batch_size, cfg.batch_timeout);

    loop {
        let wait = batch
            .time_to_deadline()
            .unwrap_or(Duration::from_secs(3600));

        if !batch.is_ripe() {
            tokio::select! {
                _ = async { shutdown.wait_for(|v| *v).await.map(|r| *r) } => {
                    // Flush what we hold, then leave; unacked deliveries
                    // are redelivered by the broker.
                    if !batch.is_empty() {
                        flush(cfg, consumer, processor, breaker, &mut batch, shutdown).await;
                    }
                    return Ok(());
                }
                delivery = tokio::time::timeout(wait, consumer.deliveries.next()) => {
                    match delivery {
                        Ok(Some(Ok(delivery))) => batch.push(delivery),
                        Ok(Some(Err(e))) => return Err(BrokerError::Amqp(e)),
                        Ok(None) => return Err(BrokerError::RetriesExhausted(
                            "delivery stream ended".into(),
                        )),
                        Err(_) => {} // batch deadline reached
                    }
                }
            }
        }

        if batch.is_ripe() && !batch.is_empty() {
            flush(cfg, consumer, processor, breaker, &mut batch, shutdown).await;
        }
    }
}

async fn flush(
    cfg: &WorkerConfig,
    consumer: &fleet_infra::broker::QueueConsumer,
    processor: &mut BatchProcessor,
    breaker: &CircuitBreaker,
    batch: &mut BatchAccumulator<Delivery>,
    shutdown: &mut watch::Receiver<bool>,
) {
    // Fail fast while the breaker is open: hold the batch (prefetch keeps
    // the queue bounded) instead of hammering a dead database.
    while !breaker.allow() {
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let deliveries = batch.drain();
    let payloads: Vec<&[u8]> = deliveries.iter().map(|d| d.data.as_slice()).collect();
    let outcome = processor.process(&payloads).await;
    if outcome.committed {
        breaker.record_success();
    } else {
        breaker.record_failure();
    }

    let queue_name = cfg.queue.queue_name();
    let mut processed = 0u64;
    let mut failed = 0u64;

    for (delivery, disposition) in deliveries.into_iter().zip(outcome.dispositions) {
        let result = match disposition {
            Disposition::Inserted => {
                processed += 1;
                delivery.ack(BasicAckOptions::default()).await
            }
            Disposition::DuplicateDropped => delivery.ack(BasicAckOptions::default()).await,
            Disposition::DeadLetter { reason, field } => {
                failed += 1;
                processor
                    .metrics
                    .dlq_messages_total
                    .with_label_values(&[queue_name, reason])
                    .inc();
                if reason == "db_write_failure" {
                    // Queue-level dead-letter config routes the nacked
                    // message to the DLQ.
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await
                } else {
                    match publish_dead_letter(
                        &consumer.channel,
                        queue_name,
                        &delivery.data,
                        reason,
                        field,
                    )
                    .await
                    {
                        Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                        Err(e) => {
                            warn!(error = %e, "dead-letter publish failed, requeueing");
                            delivery
                                .nack(BasicNackOptions {
                                    requeue: true,
                                    ..BasicNackOptions::default()
                                })
                                .await
                        }
                    }
                }
            }
        };
        if let Err(e) = result {
            warn!(queue = queue_name, error = %e, "ack/nack failed");
        }
    }

    processor
        .metrics
        .messages_processed_total
        .with_label_values(&[queue_name])
        .inc_by(processed);
    processor
        .metrics
        .messages_failed_total
        .with_label_values(&[queue_name])
        .inc_by(failed);
}
