//! Message bus abstraction.
//!
//! Inbound messages are handed out as [`Delivery`] values. The consumer must
//! settle every delivery: [`Settlement::Ack`] commits it, [`Settlement::Retain`]
//! leaves it on its topic for redelivery. A delivery dropped without being
//! settled counts as retained.
//!
//! Each call to [`MessageBus::subscribe`] joins the bus's consumer group as one
//! more competing consumer, so `n` subscriptions to a topic share its messages.
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` (in `census-rm-testing`): tests
//! - `RedpandaMessageBus` (in `census-rm-redpanda`): Kafka-compatible brokers

use crate::error::BusError;
use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Header naming the topic a delayed message must return to.
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";

/// Header holding the earliest redelivery time (RFC 3339).
pub const NOT_BEFORE_HEADER: &str = "x-not-before";

/// Header holding the message content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// A message received from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic received from
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key
    pub key: Option<String>,
    /// Raw body
    pub payload: Vec<u8>,
    /// Headers, UTF-8 values only
    pub headers: BTreeMap<String, String>,
}

impl InboundMessage {
    /// Content type header, if present.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE_HEADER).map(String::as_str)
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Done with; never deliver again
    Ack,
    /// Leave on the topic; deliver again
    Retain,
}

/// A message awaiting settlement.
#[derive(Debug)]
pub struct Delivery {
    message: InboundMessage,
    settle: oneshot::Sender<Settlement>,
}

impl Delivery {
    /// Wrap a message; the receiver resolves when the consumer settles it.
    ///
    /// If the delivery is dropped unsettled, the receiver yields an error and
    /// the bus must treat the message as retained.
    #[must_use]
    pub fn new(message: InboundMessage) -> (Self, oneshot::Receiver<Settlement>) {
        let (settle, settled) = oneshot::channel();
        (Self { message, settle }, settled)
    }

    /// The message.
    #[must_use]
    pub const fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Settle the delivery.
    pub fn settle(self, settlement: Settlement) {
        // The bus may have shut down; nothing left to tell it.
        let _ = self.settle.send(settlement);
    }

    /// Acknowledge.
    pub fn ack(self) {
        self.settle(Settlement::Ack);
    }

    /// Retain for redelivery.
    pub fn retain(self) {
        self.settle(Settlement::Retain);
    }
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub key: Option<String>,
    /// Body
    pub payload: Vec<u8>,
    /// Headers
    pub headers: BTreeMap<String, String>,
}

impl OutboundRecord {
    /// Record with no key or headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Publish/subscribe access to the broker.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be shared as
/// `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a record and wait for the broker to accept it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker rejects the record.
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Join the consumer group for `topics` and stream deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription cannot be
    /// created.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>>;
}
