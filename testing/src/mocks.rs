//! Mock clock and collaborators.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use async_trait::async_trait;
use census_rm_core::collaborators::{
    AddressIndex, ExceptionAdvice, ExceptionManager, ExceptionReport, NewAddressEnhanced, SkippedMessage,
    UacQidGenerator,
};
use census_rm_core::environment::Clock;
use census_rm_core::error::CollaboratorError;
use census_rm_core::model::UacQidPair;
use census_rm_core::questionnaire::QuestionnaireType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use census_rm_testing::mocks::FixedClock;
/// use census_rm_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Fixed clock at 2021-03-21 10:00:00 UTC, census day.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(crate::fixtures::census_day())
}

/// Decrement `counter` if positive. True if it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// UAC/QID generator issuing sequential pairs.
///
/// QIDs are the two digit questionnaire type followed by a 14 digit serial,
/// so every pair is unique and carries its type.
#[derive(Debug, Default)]
pub struct MockUacQidGenerator {
    serial: AtomicU64,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    failures: AtomicUsize,
    delay: Duration,
    per_type: Mutex<HashMap<u8, usize>>,
}

impl MockUacQidGenerator {
    /// Generator that answers immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator that takes `delay` to answer each call.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail the next `count` calls with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Calls so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls so far for one questionnaire type.
    #[must_use]
    pub fn calls_for(&self, questionnaire_type: QuestionnaireType) -> usize {
        self.per_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&questionnaire_type.code())
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls that were in progress at the same time.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UacQidGenerator for MockUacQidGenerator {
    async fn generate(
        &self,
        questionnaire_type: QuestionnaireType,
        count: usize,
    ) -> Result<Vec<UacQidPair>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(questionnaire_type.code())
            .or_default() += 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = take_one(&self.failures);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if failed {
            return Err(CollaboratorError::Transport("connection refused".to_string()));
        }

        Ok((0..count)
            .map(|_| {
                let serial = self.serial.fetch_add(1, Ordering::SeqCst);
                UacQidPair {
                    uac: format!("uac{serial:013}"),
                    qid: format!("{:02}{serial:014}", questionnaire_type.code()),
                }
            })
            .collect())
    }
}

/// Exception manager returning scripted advice and recording every call.
#[derive(Debug, Default)]
pub struct MockExceptionManager {
    advice: Mutex<ExceptionAdvice>,
    unreachable: AtomicBool,
    fail_store: AtomicBool,
    reports: Mutex<Vec<ExceptionReport>>,
    skipped: Mutex<Vec<SkippedMessage>>,
    peeks: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockExceptionManager {
    /// Manager that gives no advice.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that always gives `advice`.
    #[must_use]
    pub fn advising(advice: ExceptionAdvice) -> Self {
        let manager = Self::new();
        manager.set_advice(advice);
        manager
    }

    /// Advice for later reports.
    pub fn set_advice(&self, advice: ExceptionAdvice) {
        *self.advice.lock().unwrap_or_else(PoisonError::into_inner) = advice;
    }

    /// Fail every report with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail every attempt to store a skipped message.
    pub fn set_fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    /// Reports received.
    #[must_use]
    pub fn reports(&self) -> Vec<ExceptionReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Skipped messages stored.
    #[must_use]
    pub fn skipped(&self) -> Vec<SkippedMessage> {
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Peek responses received, as (hash, payload).
    #[must_use]
    pub fn peeks(&self) -> Vec<(String, Vec<u8>)> {
        self.peeks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ExceptionManager for MockExceptionManager {
    async fn report_exception(&self, report: ExceptionReport) -> Result<ExceptionAdvice, CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Transport("exception manager unreachable".to_string()));
        }
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
        Ok(*self.advice.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn store_skipped_message(&self, message: SkippedMessage) -> Result<(), CollaboratorError> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Status {
                status: 503,
                body: "storage unavailable".to_string(),
            });
        }
        self.skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    async fn respond_to_peek(&self, message_hash: &str, payload: &[u8]) -> Result<(), CollaboratorError> {
        self.peeks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message_hash.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Address index recording published addresses.
#[derive(Debug, Default, Clone)]
pub struct MockAddressIndex {
    published: Arc<Mutex<Vec<NewAddressEnhanced>>>,
    fail: Arc<AtomicBool>,
}

impl MockAddressIndex {
    /// Index that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject later publishes.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Addresses accepted.
    #[must_use]
    pub fn published(&self) -> Vec<NewAddressEnhanced> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AddressIndex for MockAddressIndex {
    async fn publish(&self, address: NewAddressEnhanced) -> Result<(), CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Status {
                status: 500,
                body: "index unavailable".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address);
        Ok(())
    }
}
