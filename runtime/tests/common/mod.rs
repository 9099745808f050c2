//! Shared wiring for the runtime integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)] // Not every test file uses every helper

use census_rm_core::case_ref::CaseRefGenerator;
use census_rm_core::envelope::{EventFamily, EventType};
use census_rm_core::error::ProcessingError;
use census_rm_runtime::{CaseProcessor, RetryPolicy, UacCacheConfig, UacQidCache};
use census_rm_testing::{InMemoryCaseStore, MockAddressIndex, MockUacQidGenerator, test_clock};
use std::sync::Arc;
use std::time::Duration;

/// Processor over in-memory collaborators.
pub struct Harness {
    pub store: InMemoryCaseStore,
    pub generator: Arc<MockUacQidGenerator>,
    pub address_index: MockAddressIndex,
    pub uac_cache: Arc<UacQidCache>,
    pub processor: Arc<CaseProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_generator(MockUacQidGenerator::new())
    }

    pub fn with_generator(generator: MockUacQidGenerator) -> Self {
        Self::with_cache(generator, small_cache())
    }

    pub fn with_cache(generator: MockUacQidGenerator, cache: UacCacheConfig) -> Self {
        census_rm_testing::helpers::init_tracing();
        let store = InMemoryCaseStore::new();
        let generator = Arc::new(generator);
        let address_index = MockAddressIndex::new();
        let uac_cache = Arc::new(UacQidCache::new(generator.clone(), cache));
        let processor = Arc::new(CaseProcessor::new(
            Arc::new(store.clone()),
            Arc::clone(&uac_cache),
            Arc::new(CaseRefGenerator::new(b"test-secret").unwrap()),
            Arc::new(address_index.clone()),
            Arc::new(test_clock()),
        ));
        Self {
            store,
            generator,
            address_index,
            uac_cache,
            processor,
        }
    }

    /// Process a body on the topic of the event type's own family.
    pub async fn apply(&self, event_type: EventType, body: &[u8]) -> Result<EventType, ProcessingError> {
        let family = EventFamily::of(event_type).expect("inbound event type");
        self.processor.process(family, body).await
    }
}

/// Cache sized for tests: small batches, no refill retries.
pub fn small_cache() -> UacCacheConfig {
    UacCacheConfig {
        minimum: 2,
        batch_size: 5,
        acquire_timeout: Duration::from_secs(2),
        refill_retry: RetryPolicy::builder().max_retries(0).build(),
    }
}

/// QID of a questionnaire type with a distinct serial.
pub fn qid(questionnaire_type: u8, serial: u64) -> String {
    format!("{questionnaire_type:02}{serial:014}")
}
