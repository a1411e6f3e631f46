//! Staging buffer and broker publish task.
//!
//! Decoders push records into a bounded channel; one task drains it and
//! publishes with confirms. When the broker is down the channel fills and
//! `send` blocks, which propagates back-pressure all the way to the socket
//! read loops. Nothing is acked to a device before it is staged, and
//! nothing leaves the staging buffer until the broker confirms it.
//!
//! The broker circuit breaker gates publish attempts: while open, the
//! task sleeps through the cooldown instead of hammering a dead broker.
//! Records are held, never dropped.

use crate::metrics::GatewayMetrics;
use fleet_infra::breaker::CircuitBreaker;
use fleet_infra::broker::BrokerPublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A record ready for the broker, already serialized.
#[derive(Debug)]
pub struct OutboundRecord {
    pub routing_key: &'static str,
    pub payload: Vec<u8>,
}

/// Spawn the publish task; returns the staging sender handed to sessions.
pub fn spawn_publisher(
    broker: Arc<dyn BrokerPublisher>,
    metrics: Arc<GatewayMetrics>,
    capacity: usize,
    breaker: Arc<CircuitBreaker>,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<OutboundRecord>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutboundRecord>(capacity);

    let handle = tokio::spawn(async move {
        loop {
            let record = tokio::select! {
                _ = shutdown.wait_for(|v| *v) => break,
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            metrics.staging_depth.set(rx.len() as i64);

            // A record never leaves the buffer unpublished: retry with a
            // capped delay until the broker takes it or shutdown fires.
            let mut delay = Duration::from_millis(500);
            loop {
                metrics
                    .breaker_state
                    .with_label_values(&["broker"])
                    .set(breaker.state().code());
                if !breaker.allow() {
                    tokio::select! {
                        _ = shutdown.wait_for(|v| *v) => return,
                        () = tokio::time::sleep(Duration::from_millis(250)) => continue,
                    }
                }

                let timer = metrics.publish_seconds.start_timer();
                match broker.publish(record.routing_key, &record.payload).await {
                    Ok(()) => {
                        timer.observe_duration();
                        breaker.record_success();
                        break;
                    }
                    Err(e) => {
                        drop(timer);
                        breaker.record_failure();
                        metrics.publish_failures_total.inc();
                        warn!(routing_key = record.routing_key, error = %e, "publish failed, backing off");
                        tokio::select! {
                            _ = shutdown.wait_for(|v| *v) => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(Duration::from_secs(10));
                    }
                }
            }
        }
        // Bounded drain on shutdown: publish what is already staged.
        info!(staged = rx.len(), "publisher draining staging buffer");
        while let Ok(record) = rx.try_recv() {
            if broker.publish(record.routing_key, &record.payload).await.is_err() {
                warn!("dropping staged record during shutdown, broker unavailable");
                break;
            }
        }
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_infra::broker::MemoryBroker;

    fn test_breaker() -> Arc<CircuitBreaker> {
        // Short cooldown so outage tests recover quickly.
        Arc::new(CircuitBreaker::new("broker", 3, Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn publishes_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let metrics = GatewayMetrics::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, handle) = spawn_publisher(
            Arc::clone(&broker) as Arc<dyn BrokerPublisher>,
            metrics,
            16,
            test_breaker(),
            shutdown_rx,
        );

        for i in 0..3u8 {
            tx.send(OutboundRecord {
                routing_key: "record.telemetry",
                payload: vec![i],
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].1, vec![0]);
        assert_eq!(published[2].1, vec![2]);
    }

    #[tokio::test]
    async fn broker_outage_blocks_then_recovers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_failing(true);
        let metrics = GatewayMetrics::new();
        let breaker = test_breaker();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _handle) = spawn_publisher(
            Arc::clone(&broker) as Arc<dyn BrokerPublisher>,
            Arc::clone(&metrics),
            2,
            Arc::clone(&breaker),
            shutdown_rx,
        );

        tx.send(OutboundRecord {
            routing_key: "record.telemetry",
            payload: vec![1],
        })
        .await
        .unwrap();

        // Nothing gets through while the broker is down...
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.published().len(), 0);
        assert!(metrics.publish_failures_total.get() >= 1);

        // ...and the staged record is published once it recovers.
        broker.set_failing(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if broker.published().len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("staged record published after recovery");
        assert_eq!(
            breaker.state(),
            fleet_infra::breaker::BreakerState::Closed
        );
    }
}
