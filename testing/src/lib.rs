//! # Census RM Testing
//!
//! Test doubles for the census case processor.
//!
//! This crate provides:
//! - [`InMemoryCaseStore`]: transactional store with per-case locks and an outbox
//! - [`InMemoryMessageBus`]: competing-consumer bus that records publishes and
//!   settlements
//! - [`mocks`]: fixed clock, UAC/QID generator, exception manager and address
//!   index
//! - [`fixtures`]: envelopes, cases and links
//! - [`helpers`], [`properties`]: waiting helpers and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use census_rm_testing::{InMemoryCaseStore, fixtures, mocks};
//!
//! #[tokio::test]
//! async fn receipt_marks_case() {
//!     let store = InMemoryCaseStore::new();
//!     let case = fixtures::household_case("E12000001");
//!     store.insert_link(fixtures::link("0120000000000001", Some(case.case_id)));
//!     store.insert_case(case);
//!
//!     processor.process(EventFamily::Receipt, &fixtures::response("0120000000000001")).await?;
//! }
//! ```

pub mod bus;
pub mod fixtures;
pub mod mocks;
pub mod store;

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    /// passes. Returns whether it held.
    pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Install a test-writer `tracing` subscriber honouring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use census_rm_core::model::{AddressLevel, CaseType, RefusalType};
    use census_rm_core::questionnaire::QuestionnaireType;
    use proptest::prelude::*;

    /// Any case type.
    pub fn case_type() -> impl Strategy<Value = CaseType> {
        prop_oneof![
            Just(CaseType::Household),
            Just(CaseType::HouseholdIndividual),
            Just(CaseType::CommunalEstablishment),
            Just(CaseType::SpecialPopulationGroup),
        ]
    }

    /// Any address level.
    pub fn address_level() -> impl Strategy<Value = AddressLevel> {
        prop_oneof![Just(AddressLevel::Establishment), Just(AddressLevel::Unit)]
    }

    /// No refusal or either refusal type.
    pub fn refusal() -> impl Strategy<Value = Option<RefusalType>> {
        prop_oneof![
            Just(None),
            Just(Some(RefusalType::HardRefusal)),
            Just(Some(RefusalType::ExtraordinaryRefusal)),
        ]
    }

    /// Any questionnaire type that can be issued.
    pub fn questionnaire_type() -> impl Strategy<Value = QuestionnaireType> {
        (prop::sample::select(vec![0_u8, 1, 2, 3, 7, 8]), 1_u8..=4)
            .prop_filter_map("known questionnaire type", |(form, country)| {
                QuestionnaireType::new(form * 10 + country).ok()
            })
    }
}

// Re-export commonly used items
pub use bus::InMemoryMessageBus;
pub use mocks::{FixedClock, MockAddressIndex, MockExceptionManager, MockUacQidGenerator, test_clock};
pub use store::InMemoryCaseStore;
