//! Outbox relay.
//!
//! Handlers queue outbound events in the processing transaction. The
//! [`OutboxRelay`] claims committed records, publishes them to the topic of
//! their destination with the routing key header and marks them published.
//! A record whose publish fails stays pending and is claimed again once its
//! lease has expired, so delivery downstream is at-least-once.

use crate::metrics::OutboxMetrics;
use census_rm_core::bus::{CONTENT_TYPE_HEADER, MessageBus, OutboundRecord};
use census_rm_core::error::StoreError;
use census_rm_core::outbound::{Destination, ROUTING_KEY_HEADER};
use census_rm_core::store::{OutboxRecord, OutboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Topic for case and UAC events
    pub case_events_topic: String,
    /// Topic for field instructions
    pub field_topic: String,
    /// Records claimed per poll
    pub batch_size: usize,
    /// Wait between polls that found nothing
    pub poll_interval: Duration,
    /// How long a claimed record is hidden from other relays
    pub lease: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            case_events_topic: "case-processor.case-events".to_string(),
            field_topic: "case-processor.field".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(30),
        }
    }
}

impl OutboxConfig {
    /// Topic for a destination.
    #[must_use]
    pub fn topic(&self, destination: Destination) -> &str {
        match destination {
            Destination::CaseEvents => &self.case_events_topic,
            Destination::Field => &self.field_topic,
        }
    }
}

/// Publishes committed outbound events.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    config: OutboxConfig,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn MessageBus>, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    /// Claim one batch and publish it.
    ///
    /// Returns the number of records published. Records that fail to publish
    /// are left pending; the batch stops at the first failure so records for
    /// the same key stay in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if records cannot be claimed or marked.
    pub async fn relay_once(&self) -> Result<usize, StoreError> {
        let records = self
            .store
            .claim_pending(self.config.batch_size, self.config.lease)
            .await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            match self.bus.publish(self.to_bus_record(record)).await {
                Ok(()) => published.push(id),
                Err(e) => {
                    OutboxMetrics::record_publish_failure();
                    tracing::warn!(outbox_id = %id, error = %e, "Outbox publish failed");
                    break;
                },
            }
        }

        let count = published.len();
        if count > 0 {
            self.store.mark_published(published).await?;
            OutboxMetrics::record_published(count);
        }
        Ok(count)
    }

    fn to_bus_record(&self, record: OutboxRecord) -> OutboundRecord {
        OutboundRecord::new(self.config.topic(record.destination), record.payload)
            .with_key(record.key)
            .with_header(ROUTING_KEY_HEADER, record.routing_key)
            .with_header(CONTENT_TYPE_HEADER, "application/json")
    }

    /// Poll until shutdown.
    ///
    /// A full batch is followed immediately by another poll; otherwise the
    /// relay sleeps for the poll interval.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Outbox relay started");
            loop {
                let idle = match self.relay_once().await {
                    Ok(count) => count < self.config.batch_size,
                    Err(e) => {
                        tracing::error!(error = %e, "Outbox relay poll failed");
                        true
                    },
                };
                if idle {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                } else if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
            }
            tracing::info!("Outbox relay stopped");
        })
    }
}
