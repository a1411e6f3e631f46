//! Engine consume loop: batches telemetry deliveries off the engine's
//! queue, runs the pipeline per record, and flushes the pending-writes
//! buffer under the same batching and acknowledgement rules as the
//! persistence consumer.

use crate::metrics::EngineMetrics;
use crate::pipeline::Pipeline;
use crate::store::EngineStore;
use fleet_infra::breaker::CircuitBreaker;
use fleet_infra::broker::{open_consumer, BrokerError};
use fleet_infra::config::BrokerConfig;
use fleet_proto::topology::ENGINE_QUEUE;
use fleet_proto::TelemetryRecord;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct EngineWorkerConfig {
    pub worker_id: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub prefetch: u16,
    pub shadow_mode: bool,
}

pub async fn run_engine_worker(
    cfg: EngineWorkerConfig,
    broker_cfg: BrokerConfig,
    mut pipeline: Pipeline,
    store: Arc<dyn EngineStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let consumer_tag = format!("engine-worker-{}", cfg.worker_id);
    let mut reconnect_delay = Duration::from_millis(500);

    while !*shutdown.borrow() {
        let consumer = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            consumer = open_consumer(&broker_cfg, ENGINE_QUEUE, cfg.prefetch, &consumer_tag) => consumer,
        };
        let mut consumer = match consumer {
            Ok(consumer) => {
                info!(tag = %consumer_tag, "engine consumer attached");
                reconnect_delay = Duration::from_millis(500);
                consumer
            }
            Err(e) => {
                warn!(error = %e, "engine consumer connect failed, backing off");
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
                continue;
            }
        };

        if let Err(e) = consume_loop(
            &cfg,
            &mut consumer,
            &mut pipeline,
            &store,
            &breaker,
            &metrics,
            &mut shutdown,
        )
        .await
        {
            warn!(error = %e, "engine consume loop failed, reconnecting");
        } else {
            break;
        }
    }
    info!(tag = %consumer_tag, "engine worker stopped");
}

async fn consume_loop(
    cfg: &EngineWorkerConfig,
    consumer: &mut fleet_infra::broker::QueueConsumer,
    pipeline: &mut Pipeline,
    store: &Arc<dyn EngineStore>,
    breaker: &CircuitBreaker,
    metrics: &EngineMetrics,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut batch: Vec<Delivery> = Vec::with_capacity(cfg.batch_size);
    let mut first_at: Option<Instant> = None;

    loop {
        let deadline = match first_at {
            Some(first) => cfg.batch_timeout.saturating_sub(first.elapsed()),
            None => Duration::from_secs(3600),
        };
        let ripe = batch.len() >= cfg.batch_size
            || first_at.is_some_and(|f| f.elapsed() >= cfg.batch_timeout);

        if !ripe {
            tokio::select! {
                _ = async { shutdown.wait_for(|v| *v).await.map(|r| *r) } => {
                    if !batch.is_empty() {
                        flush(cfg, pipeline, store, breaker, metrics, &mut batch).await;
                    }
                    return Ok(());
                }
                delivery = tokio::time::timeout(deadline, consumer.deliveries.next()) => {
                    match delivery {
                        Ok(Some(Ok(delivery))) => {
                            if batch.is_empty() {
                                first_at = Some(Instant::now());
                            }
                            batch.push(delivery);
                        }
                        Ok(Some(Err(e))) => return Err(BrokerError::Amqp(e)),
                        Ok(None) => return Err(BrokerError::RetriesExhausted(
                            "delivery stream ended".into(),
                        )),
                        Err(_) => {} // batch window elapsed
                    }
                }
            }
            continue;
        }

        flush(cfg, pipeline, store, breaker, metrics, &mut batch).await;
        first_at = None;
    }
}

async fn flush(
    cfg: &EngineWorkerConfig,
    pipeline: &mut Pipeline,
    store: &Arc<dyn EngineStore>,
    breaker: &CircuitBreaker,
    metrics: &EngineMetrics,
    batch: &mut Vec<Delivery>,
) {
    let deliveries = std::mem::take(batch);
    let mut processed = 0u64;
    let mut failed = 0u64;

    for delivery in &deliveries {
        match serde_json::from_slice::<TelemetryRecord>(&delivery.data) {
            Ok(record) => {
                pipeline.handle_record(&record).await;
                processed += 1;
            }
            Err(e) => {
                debug!(error = %e, "undecodable record skipped");
                failed += 1;
            }
        }
    }

    let committed = if cfg.shadow_mode {
        true
    } else {
        while !breaker.allow() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let committed = pipeline.flush(store.as_ref()).await;
        if committed {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        committed
    };

    for delivery in deliveries {
        let result = if committed {
            delivery.ack(BasicAckOptions::default()).await
        } else {
            // Permanent write failure: the queue's dead-letter binding
            // routes the nacked deliveries to the DLQ.
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await
        };
        if let Err(e) = result {
            warn!(error = %e, "engine ack/nack failed");
        }
    }

    metrics
        .records_processed_total
        .with_label_values(&[ENGINE_QUEUE])
        .inc_by(processed);
    metrics
        .records_failed_total
        .with_label_values(&[ENGINE_QUEUE])
        .inc_by(if committed { failed } else { failed + processed });
}
