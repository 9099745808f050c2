//! Topic consumers with automatic reconnection.
//!
//! [`EventConsumer`] owns the subscribe-process-reconnect loop for one
//! competing consumer; a [`DeliveryHandler`] decides what happens to each
//! delivery. [`EventConsumer::spawn_workers`] starts a pool of consumers that
//! share the topic through the bus's consumer group.
//!
//! ```text
//! loop {
//!     subscribe (retry after `retry_delay` on failure)
//!     loop {
//!         next delivery -> handler settles it
//!         shutdown -> stop
//!     }
//!     stream ended -> wait `retry_delay`, resubscribe
//! }
//! ```
//!
//! [`CaseEventHandler`] is the handler for inbound event topics: it applies
//! the message through the [`CaseProcessor`] and acknowledges it, or hands the
//! failure to the [`ResiliencePipeline`].

use crate::engine::CaseProcessor;
use crate::metrics::ProcessingMetrics;
use crate::resilience::ResiliencePipeline;
use async_trait::async_trait;
use census_rm_core::bus::{Delivery, DeliveryStream, MessageBus};
use census_rm_core::envelope::EventFamily;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default wait before resubscribing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Settles deliveries taken from a subscription.
///
/// Implementors must settle (or drop, which retains) every delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handle one delivery.
    async fn handle(&self, delivery: Delivery);
}

/// Errors building a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A required builder field was not set
    #[error("Consumer builder is missing '{0}'")]
    MissingField(&'static str),
}

/// One competing consumer.
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl EventConsumer {
    /// Create a consumer with the default retry delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            bus,
            handler,
            shutdown,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Set the wait before resubscribing.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the consumer as a background task until shutdown.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run `workers` copies of this consumer, each one a member of the
    /// topic's consumer group.
    #[must_use]
    pub fn spawn_workers(self, workers: usize) -> Vec<JoinHandle<()>> {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for worker in 1..workers {
            let copy = Self {
                name: format!("{}-{worker}", self.name),
                topics: self.topics.clone(),
                bus: Arc::clone(&self.bus),
                handler: Arc::clone(&self.handler),
                shutdown: self.shutdown.resubscribe(),
                retry_delay: self.retry_delay,
            };
            handles.push(copy.spawn());
        }
        let first = Self {
            name: format!("{}-0", self.name),
            ..self
        };
        handles.push(first.spawn());
        handles
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.bus.subscribe(&topics) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed");
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(consumer = %self.name, "Delivery stream ended, resubscribing in {:?}", self.retry_delay);
                            tokio::time::sleep(self.retry_delay).await;
                        },
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe, retrying in {:?}",
                                self.retry_delay
                            );
                            tokio::time::sleep(self.retry_delay).await;
                        },
                    }
                }
            }
        }

        info!(consumer = %self.name, "Consumer stopped");
    }

    /// Hand deliveries to the handler. Returns `true` on shutdown, `false`
    /// when the stream ended.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => self.handler.handle(delivery).await,
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Error receiving delivery");
                        },
                        None => return false,
                    }
                }
            }
        }
    }
}

/// Builder for [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    bus: Option<Arc<dyn MessageBus>>,
    handler: Option<Arc<dyn DeliveryHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_delay: Option<Duration>,
}

impl EventConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set topics to subscribe to.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Set the bus.
    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the delivery handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set custom retry delay (default: 5 seconds).
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::MissingField`] if name, topics, bus, handler
    /// or shutdown was not set.
    pub fn build(self) -> Result<EventConsumer, ConsumerError> {
        Ok(EventConsumer {
            name: self.name.ok_or(ConsumerError::MissingField("name"))?,
            topics: self.topics.ok_or(ConsumerError::MissingField("topics"))?,
            bus: self.bus.ok_or(ConsumerError::MissingField("bus"))?,
            handler: self.handler.ok_or(ConsumerError::MissingField("handler"))?,
            shutdown: self.shutdown.ok_or(ConsumerError::MissingField("shutdown"))?,
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        })
    }
}

/// Applies inbound events from one family's topic.
pub struct CaseEventHandler {
    family: EventFamily,
    processor: Arc<CaseProcessor>,
    resilience: Arc<ResiliencePipeline>,
}

impl CaseEventHandler {
    /// Create a handler for `family`.
    #[must_use]
    pub const fn new(
        family: EventFamily,
        processor: Arc<CaseProcessor>,
        resilience: Arc<ResiliencePipeline>,
    ) -> Self {
        Self {
            family,
            processor,
            resilience,
        }
    }
}

#[async_trait]
impl DeliveryHandler for CaseEventHandler {
    async fn handle(&self, delivery: Delivery) {
        let started = Instant::now();
        let result = self
            .processor
            .process(self.family, &delivery.message().payload)
            .await;

        match result {
            Ok(_) => {
                ProcessingMetrics::record_processed(self.family.name(), started.elapsed());
                delivery.ack();
            },
            Err(e) => {
                ProcessingMetrics::record_failed(self.family.name(), e.kind());
                let disposition = self.resilience.handle_failure(delivery, &e).await;
                tracing::debug!(family = %self.family, ?disposition, "Failed message settled");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn builder_reports_missing_fields() {
        let (_tx, rx) = broadcast::channel::<()>(1);
        let result = EventConsumer::builder()
            .name("receipt")
            .topics(vec!["receipt".to_string()])
            .shutdown(rx)
            .build();
        assert_eq!(result.err(), Some(ConsumerError::MissingField("bus")));
    }
}
