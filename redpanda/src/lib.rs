//! Redpanda message bus for the census case processor.
//!
//! Implements [`MessageBus`] from `census-rm-core` with rdkafka, so it works
//! against Redpanda or any Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Each subscription is one member of the consumer group and has at most one
//!   unsettled delivery in flight
//! - [`Settlement::Ack`] commits the message's offset
//! - [`Settlement::Retain`] (or a dropped delivery) seeks the partition back
//!   to the message, which is then delivered again after `retain_backoff`
//! - Record headers are carried in both directions; non UTF-8 header values
//!   are dropped on receipt
//!
//! # Example
//!
//! ```no_run
//! use census_rm_redpanda::RedpandaMessageBus;
//! use census_rm_core::bus::{MessageBus, OutboundRecord};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("case-processor")
//!     .build()?;
//!
//! bus.publish(OutboundRecord::new("event.response", b"{}".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use census_rm_core::bus::{
    Delivery, DeliveryStream, InboundMessage, MessageBus, OutboundRecord, Settlement,
};
use census_rm_core::error::BusError;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Offset;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "census-rm-case-processor";

/// Redpanda-backed [`MessageBus`].
pub struct RedpandaMessageBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    auto_offset_reset: String,
    retain_backoff: Duration,
}

impl RedpandaMessageBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group every subscription joins.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Builder for a [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    retain_backoff: Option<Duration>,
}

impl RedpandaMessageBusBuilder {
    /// Comma-separated broker addresses (e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group joined by every subscription.
    ///
    /// Default: [`DEFAULT_CONSUMER_GROUP`]
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts reading.
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Pause before a retained message is delivered again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn retain_backoff(mut self, backoff: Duration) -> Self {
        self.retain_backoff = Some(backoff);
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            consumer_group = %consumer_group,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaMessageBus created"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group,
            auto_offset_reset,
            retain_backoff: self.retain_backoff.unwrap_or(Duration::from_secs(1)),
        })
    }
}

/// Kafka headers for an outbound record.
fn to_kafka_headers(headers: &BTreeMap<String, String>) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

/// Copy a received record; headers without a UTF-8 value are skipped.
fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    let value = std::str::from_utf8(header.value?).ok()?;
                    Some((header.key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .map(str::to_string),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

impl MessageBus for RedpandaMessageBus {
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let headers = to_kafka_headers(&record.headers);
            let mut kafka_record = FutureRecord::<str, [u8]>::to(&record.topic)
                .payload(record.payload.as_slice())
                .headers(headers);
            kafka_record.key = record.key.as_deref();

            match self.producer.send(kafka_record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %record.topic,
                        partition,
                        offset,
                        "Record published"
                    );
                    metrics::counter!("bus.published", "topic" => record.topic.clone()).increment(1);
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %record.topic,
                        error = %kafka_error,
                        "Failed to publish record"
                    );
                    Err(BusError::PublishFailed {
                        topic: record.topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %self.consumer_group,
                "Subscribed to topics"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(1);
            let retain_backoff = self.retain_backoff;
            tokio::spawn(forward(consumer, tx, retain_backoff));

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Hand deliveries to the subscriber one at a time and apply each settlement
/// before fetching the next record.
async fn forward(
    consumer: StreamConsumer,
    tx: tokio::sync::mpsc::Sender<Result<Delivery, BusError>>,
    retain_backoff: Duration,
) {
    use futures::StreamExt;

    let mut stream = consumer.stream();
    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                let err = BusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let inbound = to_inbound(&message);
        let (delivery, settled) = Delivery::new(inbound);
        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!("Subscriber dropped, exiting consumer task");
            break;
        }

        match settled.await {
            Ok(Settlement::Ack) => {
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                }
            },
            Ok(Settlement::Retain) | Err(_) => {
                tracing::debug!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Message retained, seeking back"
                );
                metrics::counter!("bus.retained", "topic" => message.topic().to_string()).increment(1);
                tokio::time::sleep(retain_backoff).await;
                if let Err(e) = consumer.seek(
                    message.topic(),
                    message.partition(),
                    Offset::Offset(message.offset()),
                    Duration::from_secs(5),
                ) {
                    tracing::error!(
                        topic = message.topic(),
                        partition = message.partition(),
                        error = %e,
                        "Failed to seek back to retained message"
                    );
                }
            },
        }
    }

    tracing::debug!("Consumer task exiting");
}
