//! Triage, quarantine and delayed redelivery of failed messages.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use async_trait::async_trait;
use census_rm_core::bus::{NOT_BEFORE_HEADER, ORIGINAL_TOPIC_HEADER, Settlement};
use census_rm_core::collaborators::{ExceptionAdvice, ExceptionManager, ExceptionReport, SkippedMessage};
use census_rm_core::error::{CollaboratorError, ProcessingError};
use census_rm_core::hashing::sha256_hex;
use census_rm_runtime::consumer::DeliveryHandler;
use census_rm_runtime::{DelayRelay, Disposition, ResilienceConfig, ResiliencePipeline};
use census_rm_testing::helpers::eventually;
use census_rm_testing::{InMemoryMessageBus, MockExceptionManager, test_clock};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const TOPIC: &str = "receipt";
const BODY: &[u8] = br#"{"event":{"type":"RESPONSE_RECEIVED"}}"#;

fn config() -> ResilienceConfig {
    ResilienceConfig {
        redelivery_delay: Duration::from_millis(20),
        ..ResilienceConfig::default()
    }
}

fn pipeline(manager: Arc<dyn ExceptionManager>, bus: &InMemoryMessageBus) -> ResiliencePipeline {
    ResiliencePipeline::new(manager, Arc::new(bus.clone()), Arc::new(test_clock()), config())
}

fn failure() -> ProcessingError {
    ProcessingError::CaseNotFound("3fa85f64-5717-4562-b3fc-2c963f66afa6".to_string())
}

async fn settled(bus: &InMemoryMessageBus, expected: &[Settlement]) -> bool {
    eventually(Duration::from_secs(1), || bus.settlements_on(TOPIC) == expected).await
}

fn skip() -> ExceptionAdvice {
    ExceptionAdvice {
        skip_it: true,
        ..ExceptionAdvice::default()
    }
}

#[tokio::test]
async fn default_advice_delays_the_message() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::new());
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Delayed);
    assert!(settled(&bus, &[Settlement::Ack]).await);
    let reports = manager.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message_hash, sha256_hex(BODY));
    assert_eq!(reports[0].queue, TOPIC);
    assert_eq!(reports[0].exception_class, "case_not_found");

    let delayed = bus.published_to(&config().delay_topic);
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].payload, BODY);
    assert_eq!(delayed[0].headers.get(ORIGINAL_TOPIC_HEADER).map(String::as_str), Some(TOPIC));
    assert!(delayed[0].headers.contains_key(NOT_BEFORE_HEADER));
}

#[tokio::test]
async fn skipped_message_is_stored_quarantined_then_acknowledged() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::advising(skip()));
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Quarantined);
    assert!(settled(&bus, &[Settlement::Ack]).await);
    let skipped = manager.skipped();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].message_payload, BODY);
    assert_eq!(skipped[0].queue, TOPIC);
    assert_eq!(bus.published_to(&config().quarantine_topic).len(), 1);
    assert!(bus.published_to(&config().delay_topic).is_empty());
}

/// Records what had happened on the bus when the skipped copy was stored.
struct Observing {
    bus: InMemoryMessageBus,
    quarantine_topic: String,
    seen_at_store: Mutex<Option<(usize, usize)>>,
}

#[async_trait]
impl ExceptionManager for Observing {
    async fn report_exception(&self, _report: ExceptionReport) -> Result<ExceptionAdvice, CollaboratorError> {
        Ok(skip())
    }

    async fn store_skipped_message(&self, _message: SkippedMessage) -> Result<(), CollaboratorError> {
        let quarantined = self.bus.published_to(&self.quarantine_topic).len();
        let settlements = self.bus.settlements_on(TOPIC).len();
        *self.seen_at_store.lock().unwrap_or_else(PoisonError::into_inner) = Some((quarantined, settlements));
        Ok(())
    }

    async fn respond_to_peek(&self, _message_hash: &str, _payload: &[u8]) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[tokio::test]
async fn skipped_copy_is_stored_before_the_message_leaves_its_topic() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(Observing {
        bus: bus.clone(),
        quarantine_topic: config().quarantine_topic,
        seen_at_store: Mutex::new(None),
    });
    bus.inject(TOPIC, BODY);

    pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(*manager.seen_at_store.lock().unwrap(), Some((0, 0)));
    assert!(settled(&bus, &[Settlement::Ack]).await);
}

#[tokio::test]
async fn failed_archive_retains_the_message() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::advising(skip()));
    manager.set_fail_store(true);
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Retained);
    assert!(settled(&bus, &[Settlement::Retain]).await);
    assert!(bus.published().is_empty());
    assert_eq!(bus.queued(TOPIC), 1);
}

#[tokio::test]
async fn failed_quarantine_publish_retains_the_message() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::advising(skip()));
    bus.fail_publishes_to(&config().quarantine_topic);
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Retained);
    assert!(settled(&bus, &[Settlement::Retain]).await);
    assert_eq!(manager.skipped().len(), 1);
}

#[tokio::test]
async fn unreachable_exception_manager_falls_back_to_delay() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::advising(skip()));
    manager.set_unreachable(true);
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Delayed);
    assert!(manager.skipped().is_empty());
    assert_eq!(bus.published_to(&config().delay_topic).len(), 1);
}

#[tokio::test]
async fn failed_delay_publish_retains_the_message() {
    let bus = InMemoryMessageBus::new();
    bus.fail_publishes_to(&config().delay_topic);
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(Arc::new(MockExceptionManager::new()), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Retained);
    assert!(settled(&bus, &[Settlement::Retain]).await);
}

#[tokio::test]
async fn peek_sends_the_raw_body_and_still_delays() {
    let bus = InMemoryMessageBus::new();
    let manager = Arc::new(MockExceptionManager::advising(ExceptionAdvice {
        peek: true,
        ..ExceptionAdvice::default()
    }));
    bus.inject(TOPIC, BODY);

    let disposition = pipeline(manager.clone(), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;

    assert_eq!(disposition, Disposition::Delayed);
    assert_eq!(manager.peeks(), vec![(sha256_hex(BODY), BODY.to_vec())]);
}

#[tokio::test]
async fn delay_relay_returns_message_to_its_topic() {
    let bus = InMemoryMessageBus::new();
    let config = config();
    bus.inject(TOPIC, BODY);
    pipeline(Arc::new(MockExceptionManager::new()), &bus)
        .handle_failure(bus.take(TOPIC).unwrap(), &failure())
        .await;
    assert!(settled(&bus, &[Settlement::Ack]).await);
    assert_eq!(bus.queued(TOPIC), 0);

    let relay = DelayRelay::new(
        Arc::new(bus.clone()),
        Arc::new(test_clock()),
        config.quarantine_topic.clone(),
        Duration::from_secs(1),
    );
    let started = tokio::time::Instant::now();
    relay.handle(bus.take(&config.delay_topic).unwrap()).await;

    assert!(started.elapsed() >= config.redelivery_delay);
    assert_eq!(bus.queued(TOPIC), 1);
    let redelivered = bus.published_to(TOPIC);
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].payload, BODY);
    assert!(!redelivered[0].headers.contains_key(NOT_BEFORE_HEADER));
    assert!(
        eventually(Duration::from_secs(1), || {
            bus.settlements_on(&config.delay_topic) == [Settlement::Ack]
        })
        .await
    );
}
