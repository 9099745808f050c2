//! Integration tests for [`RedpandaMessageBus`] against a real Kafka broker.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p census-rm-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use census_rm_core::bus::{MessageBus, OutboundRecord};
use census_rm_redpanda::RedpandaMessageBus;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP: &[u8] = b"warmup";

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn bus(brokers: &str, group: &str) -> RedpandaMessageBus {
    RedpandaMessageBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .retain_backoff(Duration::from_millis(100))
        .build()
        .expect("Failed to create message bus")
}

/// Publish a warmup record until the topic exists.
async fn ensure_topic_exists(bus: &RedpandaMessageBus, topic: &str) {
    for attempt in 1..=60 {
        if bus
            .publish(OutboundRecord::new(topic, WARMUP.to_vec()))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

#[tokio::test]
#[ignore]
async fn test_headers_and_key_survive_the_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "round-trip");
    ensure_topic_exists(&bus, "event.response").await;

    let mut stream = bus.subscribe(&["event.response"]).await.expect("Failed to subscribe");
    bus.publish(
        OutboundRecord::new("event.response", b"{\"qid\":\"01\"}".to_vec())
            .with_key("case-1")
            .with_header("x-routing-key", "event.case.update"),
    )
    .await
    .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream.next().await.expect("stream ended").expect("delivery");
            if delivery.message().payload == WARMUP {
                delivery.ack();
                continue;
            }
            let message = delivery.message().clone();
            delivery.ack();
            break message;
        }
    })
    .await
    .expect("Timeout waiting for record");

    assert_eq!(received.key.as_deref(), Some("case-1"));
    assert_eq!(received.payload, b"{\"qid\":\"01\"}");
    assert_eq!(
        received.headers.get("x-routing-key").map(String::as_str),
        Some("event.case.update")
    );
}

#[tokio::test]
#[ignore]
async fn test_retained_message_is_delivered_again() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "retain");
    ensure_topic_exists(&bus, "event.refusal").await;

    let mut stream = bus.subscribe(&["event.refusal"]).await.expect("Failed to subscribe");
    bus.publish(OutboundRecord::new("event.refusal", b"refusal".to_vec()))
        .await
        .expect("Failed to publish");

    let offsets = tokio::time::timeout(Duration::from_secs(20), async {
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let delivery = stream.next().await.expect("stream ended").expect("delivery");
            if delivery.message().payload == WARMUP {
                delivery.ack();
                continue;
            }
            seen.push(delivery.message().offset);
            if seen.len() == 1 {
                delivery.retain();
            } else {
                delivery.ack();
            }
        }
        seen
    })
    .await
    .expect("Timeout waiting for redelivery");

    assert_eq!(offsets[0], offsets[1]);
}
