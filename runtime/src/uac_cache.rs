//! Self-refilling supply of UAC/QID pairs.
//!
//! Generating pairs is a slow remote call; consumers need them on the hot path
//! of case creation. The cache keeps one bounded queue per questionnaire type
//! and tops it up in the background:
//!
//! - [`UacQidCache::acquire`] pops a pair, waiting up to `acquire_timeout`
//!   when the queue is empty.
//! - When a queue falls below `minimum`, a single refill task is spawned for
//!   that type. A compare-and-swap on the type's `refilling` flag keeps it to
//!   one in flight.
//! - The refill requests `batch_size` pairs (retrying transport failures with
//!   backoff) and enqueues them, up to `minimum + batch_size`.
//! - The flag is cleared by a drop guard whether the refill succeeded or not,
//!   and waiters are woken either way. A waiter that still finds the queue
//!   empty triggers the next refill, so a failed refill heals on the next
//!   demand.
//!
//! # Example
//!
//! ```rust,no_run
//! use census_rm_runtime::uac_cache::{UacCacheConfig, UacQidCache};
//! use census_rm_core::collaborators::UacQidGenerator;
//! use census_rm_core::questionnaire::QuestionnaireType;
//! use std::sync::Arc;
//!
//! # async fn example(generator: Arc<dyn UacQidGenerator>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = UacQidCache::new(generator, UacCacheConfig::default());
//! let pair = cache.acquire(QuestionnaireType::HOUSEHOLD_ENGLAND).await?;
//! println!("issued {}", pair.qid);
//! # Ok(())
//! # }
//! ```

use crate::metrics::CacheMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use census_rm_core::collaborators::UacQidGenerator;
use census_rm_core::error::{CacheError, CollaboratorError};
use census_rm_core::model::UacQidPair;
use census_rm_core::questionnaire::QuestionnaireType;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cache sizing and timing.
#[derive(Debug, Clone)]
pub struct UacCacheConfig {
    /// Refill when a queue holds fewer pairs than this
    pub minimum: usize,
    /// Pairs requested per refill
    pub batch_size: usize,
    /// How long `acquire` waits for a pair
    pub acquire_timeout: Duration,
    /// Retry policy for the generator call inside a refill
    pub refill_retry: RetryPolicy,
}

impl Default for UacCacheConfig {
    fn default() -> Self {
        Self {
            minimum: 50,
            batch_size: 200,
            acquire_timeout: Duration::from_secs(30),
            refill_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(2))
                .jitter(0.2)
                .build(),
        }
    }
}

impl UacCacheConfig {
    /// Upper bound on pairs held per questionnaire type.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.minimum + self.batch_size
    }
}

/// Queue and refill state for one questionnaire type.
#[derive(Default)]
struct TypeQueue {
    items: Mutex<VecDeque<UacQidPair>>,
    available: Notify,
    refilling: AtomicBool,
}

impl TypeQueue {
    fn pop(&self) -> Option<UacQidPair> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Append pairs up to `capacity`; returns how many were added.
    fn extend(&self, pairs: Vec<UacQidPair>, capacity: usize) -> usize {
        let added = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let room = capacity.saturating_sub(items.len());
            let added = pairs.len().min(room);
            items.extend(pairs.into_iter().take(added));
            added
        };
        self.available.notify_waiters();
        added
    }
}

/// Clears the in-flight flag and wakes waiters when a refill ends.
struct RefillGuard {
    queue: Arc<TypeQueue>,
}

impl Drop for RefillGuard {
    fn drop(&mut self) {
        self.queue.refilling.store(false, Ordering::Release);
        self.queue.available.notify_waiters();
    }
}

/// Bounded, self-refilling UAC/QID pool keyed by questionnaire type.
pub struct UacQidCache {
    generator: Arc<dyn UacQidGenerator>,
    config: UacCacheConfig,
    queues: Mutex<HashMap<QuestionnaireType, Arc<TypeQueue>>>,
}

impl UacQidCache {
    /// Create an empty cache. Queues fill on first demand.
    #[must_use]
    pub fn new(generator: Arc<dyn UacQidGenerator>, config: UacCacheConfig) -> Self {
        Self {
            generator,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The cache configuration.
    #[must_use]
    pub const fn config(&self) -> &UacCacheConfig {
        &self.config
    }

    /// Take one unused pair of the given type.
    ///
    /// Must be called from within a Tokio runtime; refills are spawned tasks.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Timeout`] if no pair became available within
    /// `acquire_timeout`.
    pub async fn acquire(&self, questionnaire_type: QuestionnaireType) -> Result<UacQidPair, CacheError> {
        let queue = self.queue_for(questionnaire_type);
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            // Register for wake-ups before looking, so a refill finishing in
            // between is not missed.
            let notified = queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = queue.pop();
            self.maybe_refill(questionnaire_type, &queue);
            if let Some(pair) = popped {
                return Ok(pair);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                CacheMetrics::record_timeout(questionnaire_type.code());
                tracing::warn!(
                    questionnaire_type = questionnaire_type.code(),
                    timeout_ms = self.config.acquire_timeout.as_millis(),
                    "Timed out waiting for a UAC/QID pair"
                );
                return Err(CacheError::Timeout {
                    questionnaire_type: questionnaire_type.code(),
                    waited: self.config.acquire_timeout,
                });
            }
        }
    }

    /// Pairs currently held for a type.
    #[must_use]
    pub fn available(&self, questionnaire_type: QuestionnaireType) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&questionnaire_type)
            .map_or(0, |queue| queue.len())
    }

    /// True while a refill for the type is in flight.
    #[must_use]
    pub fn is_refilling(&self, questionnaire_type: QuestionnaireType) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&questionnaire_type)
            .is_some_and(|queue| queue.refilling.load(Ordering::Acquire))
    }

    fn queue_for(&self, questionnaire_type: QuestionnaireType) -> Arc<TypeQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(questionnaire_type).or_default())
    }

    fn maybe_refill(&self, questionnaire_type: QuestionnaireType, queue: &Arc<TypeQueue>) {
        if queue.len() >= self.config.minimum {
            return;
        }
        if queue
            .refilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let guard = RefillGuard {
            queue: Arc::clone(queue),
        };
        let generator = Arc::clone(&self.generator);
        let policy = self.config.refill_retry.clone();
        let batch_size = self.config.batch_size;
        let capacity = self.config.capacity();

        tracing::debug!(
            questionnaire_type = questionnaire_type.code(),
            batch_size,
            "Refilling UAC/QID cache"
        );

        tokio::spawn(async move {
            let result = retry_with_predicate(
                policy,
                || generator.generate(questionnaire_type, batch_size),
                CollaboratorError::is_retryable,
            )
            .await;

            match result {
                Ok(pairs) => {
                    let received = pairs.len();
                    let added = guard.queue.extend(pairs, capacity);
                    if added < received {
                        tracing::warn!(
                            questionnaire_type = questionnaire_type.code(),
                            received,
                            added,
                            "UAC/QID cache full, discarded surplus pairs"
                        );
                    }
                    CacheMetrics::record_refill(questionnaire_type.code(), added);
                },
                Err(e) => {
                    CacheMetrics::record_refill_failure(questionnaire_type.code());
                    tracing::error!(
                        questionnaire_type = questionnaire_type.code(),
                        error = %e,
                        "UAC/QID cache refill failed"
                    );
                },
            }
            drop(guard);
        });
    }
}

impl std::fmt::Debug for UacQidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UacQidCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use census_rm_testing::mocks::MockUacQidGenerator;
    use std::collections::HashSet;

    fn config(minimum: usize, batch_size: usize) -> UacCacheConfig {
        UacCacheConfig {
            minimum,
            batch_size,
            acquire_timeout: Duration::from_secs(2),
            refill_retry: RetryPolicy::builder()
                .max_retries(0)
                .initial_delay(Duration::from_millis(1))
                .build(),
        }
    }

    #[test]
    fn capacity_is_minimum_plus_batch() {
        assert_eq!(config(5, 10).capacity(), 15);
    }

    #[tokio::test]
    async fn acquire_fills_on_first_demand() {
        let generator = Arc::new(MockUacQidGenerator::new());
        let cache = UacQidCache::new(generator.clone(), config(2, 5));

        let pair = cache.acquire(QuestionnaireType::HOUSEHOLD_ENGLAND).await.unwrap();

        assert!(pair.qid.starts_with("01"));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn pairs_are_never_issued_twice() {
        let generator = Arc::new(MockUacQidGenerator::new());
        let cache = UacQidCache::new(generator, config(3, 4));
        let mut seen = HashSet::new();

        for _ in 0..25 {
            let pair = cache.acquire(QuestionnaireType::CE_WALES).await.unwrap();
            assert!(seen.insert(pair.qid), "duplicate pair issued");
        }
    }

    #[tokio::test]
    async fn types_are_kept_apart() {
        let generator = Arc::new(MockUacQidGenerator::new());
        let cache = UacQidCache::new(generator, config(1, 2));

        let household = cache.acquire(QuestionnaireType::HOUSEHOLD_ENGLAND).await.unwrap();
        let individual = cache.acquire(QuestionnaireType::INDIVIDUAL_ENGLAND).await.unwrap();

        assert!(household.qid.starts_with("01"));
        assert!(individual.qid.starts_with("21"));
    }

    #[tokio::test]
    async fn timeout_when_generator_keeps_failing() {
        let generator = Arc::new(MockUacQidGenerator::new());
        generator.fail_next(usize::MAX);
        let mut config = config(1, 1);
        config.acquire_timeout = Duration::from_millis(100);
        let cache = UacQidCache::new(generator, config);

        let result = cache.acquire(QuestionnaireType::HOUSEHOLD_NI).await;

        assert!(matches!(
            result,
            Err(CacheError::Timeout {
                questionnaire_type: 4,
                ..
            })
        ));
    }
}
