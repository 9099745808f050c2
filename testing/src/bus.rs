//! In-memory message bus.
//!
//! One queue per topic shared by every subscriber, which makes subscribers
//! competing consumers. A delivery that is retained or dropped unsettled goes
//! back to the front of its queue. Every publish is recorded and, like a real
//! broker, also lands on the topic's queue for subscribers.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use census_rm_core::bus::{Delivery, DeliveryStream, InboundMessage, MessageBus, OutboundRecord, Settlement};
use census_rm_core::error::BusError;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct Topics {
    queues: HashMap<String, VecDeque<InboundMessage>>,
    next_offset: HashMap<String, i64>,
}

impl Topics {
    fn append(&mut self, topic: &str, key: Option<String>, payload: Vec<u8>, headers: BTreeMap<String, String>) {
        let offset = self.next_offset.entry(topic.to_string()).or_insert(0);
        let message = InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: *offset,
            key,
            payload,
            headers,
        };
        *offset += 1;
        self.queues.entry(topic.to_string()).or_default().push_back(message);
    }

    fn pop(&mut self, topics: &[String]) -> Option<InboundMessage> {
        topics
            .iter()
            .find_map(|topic| self.queues.get_mut(topic).and_then(VecDeque::pop_front))
    }
}

#[derive(Default)]
struct Inner {
    topics: Mutex<Topics>,
    arrived: Notify,
    published: Mutex<Vec<OutboundRecord>>,
    settlements: Mutex<Vec<(InboundMessage, Settlement)>>,
    failing_topics: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Inner {
    fn topics(&self) -> std::sync::MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settled(&self, message: InboundMessage, settlement: Settlement) {
        if settlement == Settlement::Retain {
            self.topics()
                .queues
                .entry(message.topic.clone())
                .or_default()
                .push_front(message.clone());
            self.arrived.notify_waiters();
        }
        self.settlements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message, settlement));
    }
}

/// In-memory [`MessageBus`] for tests.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    inner: Arc<Inner>,
}

impl InMemoryMessageBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message on a topic as if a producer had sent it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.inject_with_headers(topic, payload, BTreeMap::new());
    }

    /// Put a message with headers on a topic.
    pub fn inject_with_headers(&self, topic: &str, payload: impl Into<Vec<u8>>, headers: BTreeMap<String, String>) {
        self.inner.topics().append(topic, None, payload.into(), headers);
        self.inner.arrived.notify_waiters();
    }

    /// End every subscription stream, as a broker shutting down would.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.arrived.notify_waiters();
    }

    /// Make publishes to `topic` fail until [`Self::restore_topic`].
    pub fn fail_publishes_to(&self, topic: &str) {
        self.inner
            .failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
    }

    /// Accept publishes to `topic` again.
    pub fn restore_topic(&self, topic: &str) {
        self.inner
            .failing_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Every record published so far.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundRecord> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records published to one topic.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<OutboundRecord> {
        self.published()
            .into_iter()
            .filter(|record| record.topic == topic)
            .collect()
    }

    /// Every settlement so far, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<(InboundMessage, Settlement)> {
        self.inner
            .settlements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Settlements of messages consumed from one topic.
    #[must_use]
    pub fn settlements_on(&self, topic: &str) -> Vec<Settlement> {
        self.settlements()
            .into_iter()
            .filter(|(message, _)| message.topic == topic)
            .map(|(_, settlement)| settlement)
            .collect()
    }

    /// Messages waiting on a topic.
    #[must_use]
    pub fn queued(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .queues
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    /// Take the next message from a topic without a subscription.
    ///
    /// The returned receiver resolves when the delivery is settled; the bus
    /// records the settlement and requeues retained messages as usual.
    #[must_use]
    pub fn take(&self, topic: &str) -> Option<Delivery> {
        let message = self.inner.topics().pop(&[topic.to_string()])?;
        Some(track(&self.inner, message))
    }
}

fn track(inner: &Arc<Inner>, message: InboundMessage) -> Delivery {
    let (delivery, settled) = Delivery::new(message.clone());
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let settlement = settled.await.unwrap_or(Settlement::Retain);
        inner.settled(message, settlement);
    });
    delivery
}

impl MessageBus for InMemoryMessageBus {
    fn publish(&self, record: OutboundRecord) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        Box::pin(async move {
            let failing = self
                .inner
                .failing_topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&record.topic);
            if failing {
                return Err(BusError::PublishFailed {
                    topic: record.topic,
                    reason: "injected publish failure".to_string(),
                });
            }

            self.inner.topics().append(
                &record.topic,
                record.key.clone(),
                record.payload.clone(),
                record.headers.clone(),
            );
            self.inner
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record);
            self.inner.arrived.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(&self, topics: &[&str]) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|topic| (*topic).to_string()).collect();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    let arrived = inner.arrived.notified();
                    tokio::pin!(arrived);
                    arrived.as_mut().enable();
                    if inner.closed.load(Ordering::SeqCst) {
                        break;
                    }

                    let next = inner.topics().pop(&topics);
                    match next {
                        Some(message) => yield Ok(track(&inner, message)),
                        None => arrived.await,
                    }
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn settle_tasks() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn retained_message_is_redelivered() {
        let bus = InMemoryMessageBus::new();
        bus.inject("receipt", b"one".to_vec());
        let mut stream = bus.subscribe(&["receipt"]).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message().offset, 0);
        first.retain();
        settle_tasks().await;

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.message().payload, b"one");
        again.ack();
        settle_tasks().await;

        assert_eq!(
            bus.settlements_on("receipt"),
            vec![Settlement::Retain, Settlement::Ack]
        );
        assert_eq!(bus.queued("receipt"), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_counts_as_retained() {
        let bus = InMemoryMessageBus::new();
        bus.inject("refusal", b"x".to_vec());

        drop(bus.take("refusal").unwrap());
        settle_tasks().await;

        assert_eq!(bus.settlements_on("refusal"), vec![Settlement::Retain]);
        assert_eq!(bus.queued("refusal"), 1);
    }

    #[tokio::test]
    async fn publish_failures_can_be_injected() {
        let bus = InMemoryMessageBus::new();
        bus.fail_publishes_to("quarantine");

        let result = bus.publish(OutboundRecord::new("quarantine", b"x".to_vec())).await;
        assert!(matches!(result, Err(BusError::PublishFailed { .. })));
        assert!(bus.published().is_empty());

        bus.restore_topic("quarantine");
        bus.publish(OutboundRecord::new("quarantine", b"x".to_vec())).await.unwrap();
        assert_eq!(bus.published_to("quarantine").len(), 1);
        assert_eq!(bus.queued("quarantine"), 1);
    }

    #[tokio::test]
    async fn closing_the_bus_ends_waiting_streams() {
        let bus = InMemoryMessageBus::new();
        let mut stream = bus.subscribe(&["survey"]).await.unwrap();

        let waiting = tokio::spawn(async move { stream.next().await.is_none() });
        settle_tasks().await;
        assert!(!waiting.is_finished());

        bus.close();
        assert!(waiting.await.unwrap());
    }
}
