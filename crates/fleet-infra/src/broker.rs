//! Broker adapters (AMQP via lapin).
//!
//! The publish side is a capability trait so the decoders and tests never
//! see lapin types: [`LapinBroker`] is the one concrete implementation,
//! [`MemoryBroker`] the test fake.
//!
//! Publishes are durable only after broker confirmation. Messages are
//! marked persistent and every queue is declared durable, so records
//! survive a broker restart once confirmed.

use crate::config::BrokerConfig;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use fleet_proto::topology::{
    dead_letter_queue, ALARMS_QUEUE, DEAD_LETTER_EXCHANGE, ENGINE_QUEUE, EVENTS_QUEUE,
    HEADER_FIELD, HEADER_ORIGINAL_QUEUE, HEADER_REASON, ROUTING_ALARM, ROUTING_EVENT,
    ROUTING_TELEMETRY, TELEMETRY_QUEUE,
};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("publish confirm timed out after {0:?}")]
    ConfirmTimeout(Duration),
    #[error("broker negatively acknowledged the publish")]
    Nacked,
    #[error("publish retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Publish capability. One concrete implementation, one test fake.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish one message; returns only once the message is durable
    /// (confirmed) or retries are exhausted.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Current connection state, for readiness and metrics.
    fn is_connected(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Connection + topology
// ---------------------------------------------------------------------------

/// Open an AMQP connection using the tokio executor and reactor.
pub async fn connect_amqp(cfg: &BrokerConfig) -> Result<Connection, lapin::Error> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current());
    #[cfg(unix)]
    let options = options.with_reactor(tokio_reactor_trait::Tokio);

    Connection::connect(&cfg.amqp_url(), options).await
}

/// Declare the full topology: the records exchange, the three record
/// queues plus the engine's telemetry binding, and a dead-letter queue per
/// source queue. Idempotent; every consumer and the gateway call this at
/// startup.
pub async fn declare_topology(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    channel
        .exchange_declare(exchange, ExchangeKind::Topic, durable, FieldTable::default())
        .await?;
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Direct,
            durable,
            FieldTable::default(),
        )
        .await?;

    let bindings = [
        (TELEMETRY_QUEUE, ROUTING_TELEMETRY),
        (ALARMS_QUEUE, ROUTING_ALARM),
        (EVENTS_QUEUE, ROUTING_EVENT),
        (ENGINE_QUEUE, ROUTING_TELEMETRY),
    ];
    for (queue, routing_key) in bindings {
        // Safety net: a nack with requeue off still lands in the DLQ even
        // when the consumer could not attach reason headers.
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue.into()),
        );
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let dlq = dead_letter_queue(queue);
        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &dlq,
                DEAD_LETTER_EXCHANGE,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LapinBroker: the concrete publisher
// ---------------------------------------------------------------------------

/// AMQP publisher with confirms, reconnect, and capped exponential retry.
pub struct LapinBroker {
    cfg: BrokerConfig,
    /// Connection kept alongside its channel so the IO driver stays alive.
    state: tokio::sync::RwLock<Option<(Connection, Channel)>>,
    connected: AtomicBool,
}

impl LapinBroker {
    pub fn new(cfg: BrokerConfig) -> Self {
        LapinBroker {
            cfg,
            state: tokio::sync::RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Connect eagerly so startup fails fast on bad credentials. Not
    /// required; `publish` connects lazily as well.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.ensure_channel().await?;
        Ok(())
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..ExponentialBackoff::default()
        }
    }

    async fn ensure_channel(&self) -> Result<Channel, BrokerError> {
        if let Some((_, channel)) = self.state.read().await.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let mut slot = self.state.write().await;
        // Another task may have reconnected while we waited for the lock.
        if let Some((_, channel)) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        self.connected.store(false, Ordering::Relaxed);

        let connection = connect_amqp(&self.cfg).await?;
        let channel = connection.create_channel().await?;
        if self.cfg.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        declare_topology(&channel, &self.cfg.exchange).await?;
        info!(host = %self.cfg.host, exchange = %self.cfg.exchange, "broker connected");

        *slot = Some((connection, channel.clone()));
        self.connected.store(true, Ordering::Relaxed);
        Ok(channel)
    }

    async fn publish_once(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;

        let mut properties = BasicProperties::default();
        if self.cfg.message_persistent {
            properties = properties.with_delivery_mode(2);
        }

        let result = async {
            let confirm = channel
                .basic_publish(
                    &self.cfg.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await?;
            if self.cfg.confirms {
                let timeout = Duration::from_secs(self.cfg.confirm_timeout);
                let confirmation = tokio::time::timeout(timeout, confirm)
                    .await
                    .map_err(|_| BrokerError::ConfirmTimeout(timeout))?
                    .map_err(BrokerError::Amqp)?;
                match confirmation {
                    Confirmation::Ack(_) | Confirmation::NotRequested => {}
                    Confirmation::Nack(_) => return Err(BrokerError::Nacked),
                }
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            // Drop the channel so the next attempt reconnects.
            *self.state.write().await = None;
            self.connected.store(false, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl BrokerPublisher for LapinBroker {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let op = || async {
            self.publish_once(routing_key, payload)
                .await
                .map_err(backoff::Error::transient)
        };
        backoff::future::retry_notify(self.retry_policy(), op, |err, delay| {
            warn!(%routing_key, error = %err, ?delay, "publish failed, retrying");
        })
        .await
        .map_err(|e| BrokerError::RetriesExhausted(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Consume side
// ---------------------------------------------------------------------------

/// A consumer channel bound to one queue with a prefetch window. The
/// connection rides along so its IO driver lives as long as the consumer.
pub struct QueueConsumer {
    pub connection: Connection,
    pub channel: Channel,
    pub deliveries: lapin::Consumer,
}

/// Open a channel on a fresh connection, set prefetch, and start consuming
/// with manual acks.
pub async fn open_consumer(
    cfg: &BrokerConfig,
    queue: &str,
    prefetch: u16,
    consumer_tag: &str,
) -> Result<QueueConsumer, BrokerError> {
    let connection = connect_amqp(cfg).await?;
    let channel = connection.create_channel().await?;
    declare_topology(&channel, &cfg.exchange).await?;
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;
    let deliveries = channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(QueueConsumer {
        connection,
        channel,
        deliveries,
    })
}

/// Publish an annotated copy of a rejected message to the dead-letter
/// exchange. The caller acks the original delivery afterwards.
pub async fn publish_dead_letter(
    channel: &Channel,
    source_queue: &str,
    payload: &[u8],
    reason: &str,
    field: Option<&str>,
) -> Result<(), BrokerError> {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(HEADER_REASON),
        AMQPValue::LongString(reason.into()),
    );
    if let Some(field) = field {
        headers.insert(
            ShortString::from(HEADER_FIELD),
            AMQPValue::LongString(field.into()),
        );
    }
    headers.insert(
        ShortString::from(HEADER_ORIGINAL_QUEUE),
        AMQPValue::LongString(source_queue.into()),
    );

    channel
        .basic_publish(
            DEAD_LETTER_EXCHANGE,
            source_queue,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_headers(headers),
        )
        .await?
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryBroker: the test fake
// ---------------------------------------------------------------------------

/// In-memory publisher for tests: records every publish, can be flipped
/// into a failing state to exercise back-pressure paths.
#[derive(Default)]
pub struct MemoryBroker {
    published: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// All publishes so far as (routing key, payload) pairs.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().expect("broker mutex poisoned").clone()
    }

    pub fn count_for(&self, routing_key: &str) -> usize {
        self.published
            .lock()
            .expect("broker mutex poisoned")
            .iter()
            .filter(|(k, _)| k == routing_key)
            .count()
    }
}

#[async_trait]
impl BrokerPublisher for MemoryBroker {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(BrokerError::RetriesExhausted("memory broker failing".into()));
        }
        self.published
            .lock()
            .expect("broker mutex poisoned")
            .push((routing_key.to_owned(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.failing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_broker_records_publishes() {
        let broker = MemoryBroker::new();
        broker.publish("record.telemetry", b"a").await.unwrap();
        broker.publish("record.alarm", b"b").await.unwrap();
        assert_eq!(broker.count_for("record.telemetry"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn memory_broker_failing_mode() {
        let broker = MemoryBroker::new();
        broker.set_failing(true);
        assert!(broker.publish("record.telemetry", b"a").await.is_err());
        assert!(!broker.is_connected());
        broker.set_failing(false);
        assert!(broker.publish("record.telemetry", b"a").await.is_ok());
    }
}
