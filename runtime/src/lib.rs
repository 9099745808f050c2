//! # Census RM Runtime
//!
//! Everything that runs between the broker and the store:
//!
//! - [`engine`]: the event-to-state consistency engine ([`CaseProcessor`])
//! - [`uac_cache`]: the self-refilling UAC/QID supply cache
//! - [`emitter`]: builds outbound events and queues them in the transaction
//! - [`resilience`]: hashing, triage, quarantine and delayed redelivery of
//!   failed messages
//! - [`delay`]: republishes delayed messages when they are due
//! - [`consumer`]: subscribe-process-reconnect loops and worker pools
//! - [`outbox`]: relays committed outbound events to the broker
//! - [`retry`], [`metrics`]: supporting infrastructure
//!
//! ## Example
//!
//! ```ignore
//! use census_rm_runtime::{CaseEventHandler, CaseProcessor, EventConsumer};
//!
//! let processor = Arc::new(CaseProcessor::new(store, cache, case_refs, address_index, clock));
//! let handler = Arc::new(CaseEventHandler::new(EventFamily::Receipt, processor, resilience));
//!
//! let workers = EventConsumer::builder()
//!     .name("receipt")
//!     .topics(vec!["case-processor.receipt".to_string()])
//!     .bus(bus)
//!     .handler(handler)
//!     .shutdown(shutdown_rx)
//!     .build()?
//!     .spawn_workers(4);
//! ```

/// Topic consumers and worker pools
pub mod consumer;

/// Delayed redelivery relay
pub mod delay;

/// Outbound event construction
pub mod emitter;

/// Event-to-state consistency engine
pub mod engine;

/// Prometheus metrics for observability
pub mod metrics;

/// Transactional outbox relay
pub mod outbox;

/// Failed message triage
pub mod resilience;

/// Retry logic with exponential backoff
pub mod retry;

/// UAC/QID supply cache
pub mod uac_cache;

pub use consumer::{CaseEventHandler, DeliveryHandler, EventConsumer};
pub use delay::DelayRelay;
pub use emitter::Emitter;
pub use engine::CaseProcessor;
pub use outbox::{OutboxConfig, OutboxRelay};
pub use resilience::{Disposition, ResilienceConfig, ResiliencePipeline};
pub use retry::RetryPolicy;
pub use uac_cache::{UacCacheConfig, UacQidCache};
