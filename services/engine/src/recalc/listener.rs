//! Broker notification listener: external systems enqueue recalculation
//! jobs by publishing a JSON job request; the listener writes it into the
//! durable queue. The configuration-change path from the ops surface
//! arrives here.

use crate::recalc::queue::JobStore;
use crate::recalc::NewJob;
use fleet_infra::broker::{connect_amqp, BrokerError};
use fleet_infra::config::BrokerConfig;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Queue carrying externally published job requests.
pub const REQUEST_QUEUE: &str = "recalc_requests_queue";
pub const REQUEST_ROUTING_KEY: &str = "recalc.request";

pub async fn run_listener(
    broker_cfg: BrokerConfig,
    jobs: Arc<dyn JobStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect_delay = Duration::from_millis(500);
    while !*shutdown.borrow() {
        match listen_once(&broker_cfg, &jobs, &mut shutdown).await {
            Ok(()) => break, // clean shutdown
            Err(e) => {
                warn!(error = %e, "recalc listener disconnected, backing off");
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
                reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
            }
        }
    }
    info!("recalc listener stopped");
}

async fn listen_once(
    broker_cfg: &BrokerConfig,
    jobs: &Arc<dyn JobStore>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let connection = connect_amqp(broker_cfg).await?;
    let channel = connection.create_channel().await?;
    channel
        .queue_declare(
            REQUEST_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            REQUEST_QUEUE,
            &broker_cfg.exchange,
            REQUEST_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    let mut consumer = channel
        .basic_consume(
            REQUEST_QUEUE,
            "recalc-listener",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    info!(queue = REQUEST_QUEUE, "recalc listener attached");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => return Ok(()),
            delivery = consumer.next() => delivery,
        };
        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(BrokerError::Amqp(e)),
            None => return Err(BrokerError::RetriesExhausted("stream ended".into())),
        };

        match serde_json::from_slice::<NewJob>(&delivery.data) {
            Ok(job) => match jobs.enqueue(job).await {
                Ok(id) => {
                    info!(job = id, "externally requested job enqueued");
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(e) => {
                    warn!(error = %e, "enqueue failed, requeueing request");
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await;
                }
            },
            Err(e) => {
                // Malformed request: drop it, there is no DLQ for this
                // control queue.
                warn!(error = %e, "unparseable job request dropped");
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
        }
    }
}
