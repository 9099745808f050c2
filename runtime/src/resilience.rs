//! Message resilience pipeline.
//!
//! Every message the engine fails to apply is handed to
//! [`ResiliencePipeline::handle_failure`], which:
//!
//! 1. Hashes the raw body (SHA-256 hex)
//! 2. Reports the failure to the triage service and receives advice
//! 3. Applies the advice:
//!    - **skip**: archive a verbatim copy, publish it to the quarantine topic,
//!      then acknowledge
//!    - **peek**: send the raw body back to the triage service
//!    - **log**: structured log record (the default when no advice is given)
//! 4. Unless skipped, parks the message on the delay topic for redelivery
//!    through [`crate::delay::DelayRelay`]
//!
//! A message only leaves its topic once a copy exists somewhere else. Any
//! failure on that path leaves it retained for immediate redelivery.

use crate::metrics::ResilienceMetrics;
use census_rm_core::bus::{
    CONTENT_TYPE_HEADER, Delivery, InboundMessage, MessageBus, NOT_BEFORE_HEADER,
    ORIGINAL_TOPIC_HEADER, OutboundRecord,
};
use census_rm_core::collaborators::{ExceptionAdvice, ExceptionManager, ExceptionReport, SkippedMessage};
use census_rm_core::environment::Clock;
use census_rm_core::envelope::Envelope;
use census_rm_core::error::ProcessingError;
use census_rm_core::hashing::sha256_hex;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

/// Resilience settings.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Service name reported to the triage service
    pub service_name: String,
    /// Topic receiving copies of skipped messages
    pub quarantine_topic: String,
    /// Holding topic for delayed redelivery
    pub delay_topic: String,
    /// How long a failed message waits before redelivery
    pub redelivery_delay: Duration,
    /// Log the full error chain instead of a one-line summary
    pub log_stack_traces: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            service_name: "case-processor".to_string(),
            quarantine_topic: "case-processor.quarantine".to_string(),
            delay_topic: "case-processor.delay".to_string(),
            redelivery_delay: Duration::from_secs(2),
            log_stack_traces: false,
        }
    }
}

/// What happened to a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Archived, copied to quarantine and acknowledged
    Quarantined,
    /// Parked on the delay topic and acknowledged
    Delayed,
    /// Left on its topic for immediate redelivery
    Retained,
}

/// Triage and redelivery of failed messages.
pub struct ResiliencePipeline {
    exception_manager: Arc<dyn ExceptionManager>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    config: ResilienceConfig,
}

impl ResiliencePipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        exception_manager: Arc<dyn ExceptionManager>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        config: ResilienceConfig,
    ) -> Self {
        Self {
            exception_manager,
            bus,
            clock,
            config,
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Triage a message the engine failed to apply and settle its delivery.
    pub async fn handle_failure(&self, delivery: Delivery, error: &ProcessingError) -> Disposition {
        let message = delivery.message();
        let message_hash = sha256_hex(&message.payload);
        let advice = self.advise(message, &message_hash, error).await;

        if advice.peek {
            if let Err(e) = self
                .exception_manager
                .respond_to_peek(&message_hash, &message.payload)
                .await
            {
                tracing::warn!(message_hash = %message_hash, error = %e, "Peek response failed");
            }
        }

        if advice.log_it || advice == ExceptionAdvice::default() {
            self.log_failure(message, &message_hash, error);
        }

        let topic = message.topic.clone();
        let disposition = if advice.skip_it {
            self.quarantine(delivery, &message_hash).await
        } else {
            self.delay(delivery, &message_hash).await
        };

        match disposition {
            Disposition::Quarantined => ResilienceMetrics::record_quarantined(&topic),
            Disposition::Delayed => ResilienceMetrics::record_delayed(&topic),
            Disposition::Retained => ResilienceMetrics::record_retained(&topic),
        }
        disposition
    }

    async fn advise(&self, message: &InboundMessage, message_hash: &str, error: &ProcessingError) -> ExceptionAdvice {
        let report = ExceptionReport {
            message_hash: message_hash.to_string(),
            service: self.config.service_name.clone(),
            queue: message.topic.clone(),
            exception_class: error.kind().to_string(),
            exception_message: error.to_string(),
        };
        match self.exception_manager.report_exception(report).await {
            Ok(advice) => advice,
            Err(e) => {
                tracing::warn!(
                    message_hash = %message_hash,
                    error = %e,
                    "Exception manager unreachable, defaulting to log"
                );
                ExceptionAdvice::log_only()
            },
        }
    }

    fn log_failure(&self, message: &InboundMessage, message_hash: &str, error: &ProcessingError) {
        let valid_envelope = Envelope::is_well_formed(&message.payload);
        if self.config.log_stack_traces {
            tracing::error!(
                message_hash = %message_hash,
                topic = %message.topic,
                offset = message.offset,
                valid_envelope,
                transient = error.is_transient(),
                error = %error_chain(error),
                "Could not process message"
            );
        } else {
            tracing::error!(
                message_hash = %message_hash,
                topic = %message.topic,
                valid_envelope,
                kind = error.kind(),
                "Could not process message: {error}"
            );
        }
    }

    /// Archive, copy to quarantine, then acknowledge. Any failure retains.
    async fn quarantine(&self, delivery: Delivery, message_hash: &str) -> Disposition {
        let message = delivery.message();
        let skipped = SkippedMessage {
            message_hash: message_hash.to_string(),
            message_payload: message.payload.clone(),
            service: self.config.service_name.clone(),
            queue: message.topic.clone(),
            content_type: message.content_type().map(str::to_string),
            headers: message.headers.clone(),
            routing_key: message.key.clone(),
        };
        if let Err(e) = self.exception_manager.store_skipped_message(skipped).await {
            tracing::error!(
                message_hash = %message_hash,
                error = %e,
                "Could not store skipped message, leaving it on the queue"
            );
            delivery.retain();
            return Disposition::Retained;
        }

        let record = forwarded_record(message, &self.config.quarantine_topic);
        if let Err(e) = self.bus.publish(record).await {
            tracing::error!(
                message_hash = %message_hash,
                error = %e,
                "Could not quarantine skipped message, leaving it on the queue"
            );
            delivery.retain();
            return Disposition::Retained;
        }

        tracing::warn!(
            message_hash = %message_hash,
            topic = %message.topic,
            "Skipped message quarantined"
        );
        delivery.ack();
        Disposition::Quarantined
    }

    /// Park on the delay topic, then acknowledge. A failed publish retains.
    async fn delay(&self, delivery: Delivery, message_hash: &str) -> Disposition {
        let message = delivery.message();
        let not_before = self.clock.now()
            + chrono::Duration::from_std(self.config.redelivery_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let record = forwarded_record(message, &self.config.delay_topic)
            .with_header(NOT_BEFORE_HEADER, not_before.to_rfc3339());

        match self.bus.publish(record).await {
            Ok(()) => {
                tracing::debug!(
                    message_hash = %message_hash,
                    topic = %message.topic,
                    not_before = %not_before,
                    "Message delayed for redelivery"
                );
                delivery.ack();
                Disposition::Delayed
            },
            Err(e) => {
                tracing::warn!(
                    message_hash = %message_hash,
                    error = %e,
                    "Could not delay message, leaving it on the queue"
                );
                delivery.retain();
                Disposition::Retained
            },
        }
    }
}

/// Copy of `message` for `topic`, remembering where it came from.
fn forwarded_record(message: &InboundMessage, topic: &str) -> OutboundRecord {
    let mut record = OutboundRecord::new(topic, message.payload.clone());
    record.key.clone_from(&message.key);
    record.headers.clone_from(&message.headers);
    record
        .headers
        .entry(CONTENT_TYPE_HEADER.to_string())
        .or_insert_with(|| "application/json".to_string());
    record.with_header(ORIGINAL_TOPIC_HEADER, message.topic.clone())
}

/// `error: cause: cause` over the whole source chain.
fn error_chain(error: &dyn StdError) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
