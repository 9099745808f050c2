//! Prometheus metrics.
//!
//! Covers message processing outcomes, the resilience pipeline, the UAC/QID
//! cache, the outbox relay and collaborator retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use census_rm_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the exporter and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test), this logs a
    /// warning and returns `Ok(())` without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.build() {
            Ok((recorder, exporter)) => {
                let handle = recorder.handle();
                if let Err(e) = metrics::set_global_recorder(recorder) {
                    tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
                    return Ok(());
                }
                tokio::spawn(exporter);
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
                Ok(())
            },
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("messages.processed", "Messages applied successfully, by topic family");
    describe_counter!("messages.failed", "Messages that failed processing, by family and error kind");
    describe_counter!("messages.quarantined", "Messages skipped to the quarantine topic");
    describe_counter!("messages.delayed", "Messages sent to the delay topic for redelivery");
    describe_counter!("messages.retained", "Messages left on their topic for immediate redelivery");
    describe_histogram!(
        "message.processing_duration_seconds",
        "Time taken to process one message"
    );

    describe_counter!("uac_cache.refills", "Successful UAC/QID cache refills");
    describe_counter!("uac_cache.refill_failures", "Failed UAC/QID cache refills");
    describe_counter!("uac_cache.timeouts", "UAC/QID acquisitions that timed out");

    describe_counter!("outbox.published", "Outbound messages relayed to the broker");
    describe_counter!("outbox.publish_failures", "Outbound messages the relay failed to publish");

    describe_counter!("retry.attempts", "Collaborator call retries");
    describe_counter!("retry.successes", "Collaborator calls that succeeded after retrying");
    describe_counter!("retry.exhausted", "Collaborator calls that exhausted their retries");
}

/// Message processing metrics recorder.
pub struct ProcessingMetrics;

impl ProcessingMetrics {
    /// Record a successfully processed message.
    pub fn record_processed(family: &'static str, duration: Duration) {
        counter!("messages.processed", "family" => family).increment(1);
        histogram!("message.processing_duration_seconds", "family" => family)
            .record(duration.as_secs_f64());
    }

    /// Record a processing failure.
    pub fn record_failed(family: &'static str, kind: &'static str) {
        counter!("messages.failed", "family" => family, "kind" => kind).increment(1);
    }
}

/// Resilience pipeline metrics recorder.
pub struct ResilienceMetrics;

impl ResilienceMetrics {
    /// Record a skipped message.
    pub fn record_quarantined(topic: &str) {
        counter!("messages.quarantined", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message sent for delayed redelivery.
    pub fn record_delayed(topic: &str) {
        counter!("messages.delayed", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message retained on its topic.
    pub fn record_retained(topic: &str) {
        counter!("messages.retained", "topic" => topic.to_string()).increment(1);
    }
}

/// UAC/QID cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a completed refill.
    pub fn record_refill(questionnaire_type: u8, count: usize) {
        counter!("uac_cache.refills", "questionnaire_type" => questionnaire_type.to_string())
            .increment(1);
        tracing::debug!(questionnaire_type, count, "UAC/QID cache refilled");
    }

    /// Record a failed refill.
    pub fn record_refill_failure(questionnaire_type: u8) {
        counter!("uac_cache.refill_failures", "questionnaire_type" => questionnaire_type.to_string())
            .increment(1);
    }

    /// Record an acquisition timeout.
    pub fn record_timeout(questionnaire_type: u8) {
        counter!("uac_cache.timeouts", "questionnaire_type" => questionnaire_type.to_string())
            .increment(1);
    }
}

/// Outbox relay metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record relayed messages.
    pub fn record_published(count: usize) {
        counter!("outbox.published").increment(count as u64);
    }

    /// Record a failed publish.
    pub fn record_publish_failure() {
        counter!("outbox.publish_failures").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry.attempts").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry.successes").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry.exhausted").increment(1);
    }
}
