//! UAC/QID cache under concurrent demand and generator failures.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

mod common;

use census_rm_core::questionnaire::QuestionnaireType;
use census_rm_runtime::UacQidCache;
use census_rm_testing::MockUacQidGenerator;
use census_rm_testing::helpers::eventually;
use common::small_cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_demand_triggers_one_refill_at_a_time() {
    let generator = Arc::new(MockUacQidGenerator::with_delay(Duration::from_millis(20)));
    let cache = Arc::new(UacQidCache::new(generator.clone(), small_cache()));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.acquire(QuestionnaireType::HOUSEHOLD_ENGLAND).await })
        })
        .collect();

    let mut qids = HashSet::new();
    for task in tasks {
        let pair = task.await.unwrap().unwrap();
        assert!(qids.insert(pair.qid), "pair issued twice");
    }

    assert_eq!(qids.len(), 20);
    assert_eq!(generator.max_concurrent(), 1);
    assert!(cache.available(QuestionnaireType::HOUSEHOLD_ENGLAND) <= small_cache().capacity());
}

#[tokio::test]
async fn failed_refill_heals_on_next_demand() {
    let generator = Arc::new(MockUacQidGenerator::new());
    generator.fail_next(1);
    let cache = UacQidCache::new(generator.clone(), small_cache());

    let pair = cache.acquire(QuestionnaireType::CE_ENGLAND).await.unwrap();

    assert!(pair.qid.starts_with("31"));
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn refill_runs_in_background_once_below_minimum() {
    let generator = Arc::new(MockUacQidGenerator::new());
    let cache = UacQidCache::new(generator.clone(), small_cache());

    for _ in 0..4 {
        cache.acquire(QuestionnaireType::INDIVIDUAL_WALES).await.unwrap();
    }

    let refilled = eventually(Duration::from_secs(1), || {
        generator.calls_for(QuestionnaireType::INDIVIDUAL_WALES) == 2
            && !cache.is_refilling(QuestionnaireType::INDIVIDUAL_WALES)
    })
    .await;
    assert!(refilled);
    assert!(cache.available(QuestionnaireType::INDIVIDUAL_WALES) >= small_cache().minimum);
    assert_eq!(generator.calls_for(QuestionnaireType::HOUSEHOLD_ENGLAND), 0);
}
