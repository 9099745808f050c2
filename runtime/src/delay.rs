//! Delayed redelivery.
//!
//! The resilience pipeline parks failed messages on a holding topic with two
//! headers: [`ORIGINAL_TOPIC_HEADER`] and [`NOT_BEFORE_HEADER`]. The
//! [`DelayRelay`] consumes that topic, waits until each message is due and
//! republishes it to its original topic. The holding copy is acknowledged
//! only after the republish succeeded. A message still not due after the
//! longest single wait is retained on the holding topic and waited on again
//! when it is redelivered.

use crate::consumer::DeliveryHandler;
use async_trait::async_trait;
use census_rm_core::bus::{Delivery, InboundMessage, MessageBus, NOT_BEFORE_HEADER, ORIGINAL_TOPIC_HEADER, OutboundRecord};
use census_rm_core::environment::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Republishes delayed messages once they are due.
pub struct DelayRelay {
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    quarantine_topic: String,
    max_wait: Duration,
}

impl DelayRelay {
    /// Create a relay.
    ///
    /// Messages without an original topic are sent to `quarantine_topic`.
    /// No single wait exceeds `max_wait`, whatever the header says; a message
    /// due later than that is retained after the wait.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        quarantine_topic: impl Into<String>,
        max_wait: Duration,
    ) -> Self {
        Self {
            bus,
            clock,
            quarantine_topic: quarantine_topic.into(),
            max_wait,
        }
    }

    /// How long to wait before `message` is due.
    fn remaining(&self, message: &InboundMessage) -> Duration {
        let Some(not_before) = message
            .headers
            .get(NOT_BEFORE_HEADER)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
        else {
            return Duration::ZERO;
        };
        (not_before - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl DeliveryHandler for DelayRelay {
    async fn handle(&self, delivery: Delivery) {
        let message = delivery.message();
        let remaining = self.remaining(message);
        if !remaining.is_zero() {
            tokio::time::sleep(remaining.min(self.max_wait)).await;
        }
        if remaining > self.max_wait {
            tracing::debug!(
                offset = message.offset,
                remaining_ms = remaining.as_millis(),
                "Delayed message not due yet, retaining it"
            );
            delivery.retain();
            return;
        }

        let record = redelivery_record(message, &self.quarantine_topic);
        let topic = record.topic.clone();
        match self.bus.publish(record).await {
            Ok(()) => {
                tracing::debug!(topic = %topic, offset = message.offset, "Delayed message redelivered");
                delivery.ack();
            },
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Could not redeliver delayed message");
                delivery.retain();
            },
        }
    }
}

/// The record to publish for a delayed message: its original topic with the
/// delay headers removed.
fn redelivery_record(message: &InboundMessage, quarantine_topic: &str) -> OutboundRecord {
    let mut headers = message.headers.clone();
    headers.remove(NOT_BEFORE_HEADER);
    let topic = match headers.remove(ORIGINAL_TOPIC_HEADER) {
        Some(original) if !original.is_empty() => original,
        _ => {
            tracing::error!(
                offset = message.offset,
                "Delayed message has no original topic, quarantining it"
            );
            quarantine_topic.to_string()
        },
    };
    OutboundRecord {
        topic,
        key: message.key.clone(),
        payload: message.payload.clone(),
        headers,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use census_rm_core::bus::Settlement;
    use census_rm_testing::helpers::eventually;
    use census_rm_testing::{InMemoryMessageBus, test_clock};
    use std::collections::BTreeMap;

    fn delayed(headers: &[(&str, &str)]) -> InboundMessage {
        InboundMessage {
            topic: "case-processor.delay".into(),
            partition: 0,
            offset: 11,
            key: Some("k".into()),
            payload: b"{\"x\":1}".to_vec(),
            headers: headers
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn redelivery_goes_back_to_the_original_topic() {
        let message = delayed(&[
            (ORIGINAL_TOPIC_HEADER, "receipt"),
            (NOT_BEFORE_HEADER, "2021-03-21T10:00:00+00:00"),
            ("content-type", "application/json"),
        ]);
        let record = redelivery_record(&message, "quarantine");
        assert_eq!(record.topic, "receipt");
        assert_eq!(record.key.as_deref(), Some("k"));
        assert_eq!(record.payload, message.payload);
        assert!(!record.headers.contains_key(ORIGINAL_TOPIC_HEADER));
        assert!(!record.headers.contains_key(NOT_BEFORE_HEADER));
        assert!(record.headers.contains_key("content-type"));
    }

    #[test]
    fn missing_original_topic_is_quarantined() {
        let record = redelivery_record(&delayed(&[]), "quarantine");
        assert_eq!(record.topic, "quarantine");
    }

    fn due_in(hours: i64) -> BTreeMap<String, String> {
        let not_before = test_clock().now() + chrono::Duration::hours(hours);
        BTreeMap::from([
            (ORIGINAL_TOPIC_HEADER.to_string(), "receipt".to_string()),
            (NOT_BEFORE_HEADER.to_string(), not_before.to_rfc3339()),
        ])
    }

    fn relay(bus: &InMemoryMessageBus) -> DelayRelay {
        DelayRelay::new(
            Arc::new(bus.clone()),
            Arc::new(test_clock()),
            "quarantine",
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn message_not_due_after_the_longest_wait_is_retained() {
        let bus = InMemoryMessageBus::new();
        bus.inject_with_headers("delay", b"body".to_vec(), due_in(1));

        relay(&bus).handle(bus.take("delay").unwrap()).await;

        assert!(bus.published_to("receipt").is_empty());
        assert!(eventually(Duration::from_secs(1), || bus.settlements_on("delay") == [Settlement::Retain]).await);
        assert_eq!(bus.queued("delay"), 1);
    }

    #[tokio::test]
    async fn overdue_message_is_redelivered_at_once() {
        let bus = InMemoryMessageBus::new();
        bus.inject_with_headers("delay", b"body".to_vec(), due_in(-1));

        relay(&bus).handle(bus.take("delay").unwrap()).await;

        assert_eq!(bus.published_to("receipt").len(), 1);
        assert!(eventually(Duration::from_secs(1), || bus.settlements_on("delay") == [Settlement::Ack]).await);
    }
}
