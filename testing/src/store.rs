//! In-memory case store.
//!
//! Transactions buffer their writes and apply them at commit, so a rolled
//! back or dropped transaction leaves no trace. [`StoreTransaction::lock_case`]
//! takes a per-case async mutex held until the transaction ends, which gives
//! the same serialization as `SELECT ... FOR UPDATE`.
//!
//! Outbound messages are kept twice: as decoded [`OutboundMessage`]s for
//! assertions and as [`OutboxRecord`]s for the outbox relay.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use census_rm_core::error::StoreError;
use census_rm_core::event_log::AuditEvent;
use census_rm_core::model::{Case, UacQidLink};
use census_rm_core::outbound::{OutboundEventType, OutboundMessage};
use census_rm_core::store::{CaseStore, OutboxRecord, OutboxStore, StoreFuture, StoreTransaction};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Default)]
struct State {
    cases: HashMap<Uuid, Case>,
    links: HashMap<String, UacQidLink>,
    events: Vec<AuditEvent>,
    outbound: Vec<OutboundMessage>,
    outbox: Vec<OutboxEntry>,
}

struct OutboxEntry {
    record: OutboxRecord,
    published: bool,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    case_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    sequence: AtomicU64,
    fail_commits: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn case_lock(&self, case_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.case_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(case_id).or_default())
    }
}

/// In-memory [`CaseStore`] and [`OutboxStore`].
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```
/// use census_rm_testing::store::InMemoryCaseStore;
///
/// let store = InMemoryCaseStore::new();
/// assert!(store.cases().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryCaseStore {
    inner: Arc<Inner>,
}

impl InMemoryCaseStore {
    /// Empty store whose case sequence starts at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed case directly.
    pub fn insert_case(&self, case: Case) {
        self.inner.state().cases.insert(case.case_id, case);
    }

    /// Insert a committed link directly.
    pub fn insert_link(&self, link: UacQidLink) {
        self.inner.state().links.insert(link.qid.clone(), link);
    }

    /// Committed case by id.
    #[must_use]
    pub fn case(&self, case_id: Uuid) -> Option<Case> {
        self.inner.state().cases.get(&case_id).cloned()
    }

    /// All committed cases.
    #[must_use]
    pub fn cases(&self) -> Vec<Case> {
        self.inner.state().cases.values().cloned().collect()
    }

    /// Committed link by QID.
    #[must_use]
    pub fn link(&self, qid: &str) -> Option<UacQidLink> {
        self.inner.state().links.get(qid).cloned()
    }

    /// All committed links.
    #[must_use]
    pub fn links(&self) -> Vec<UacQidLink> {
        self.inner.state().links.values().cloned().collect()
    }

    /// Committed links attached to a case.
    #[must_use]
    pub fn links_for(&self, case_id: Uuid) -> Vec<UacQidLink> {
        self.inner
            .state()
            .links
            .values()
            .filter(|link| link.case_id == Some(case_id))
            .cloned()
            .collect()
    }

    /// Audit log, in commit order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.state().events.clone()
    }

    /// Audit records attached to a case.
    #[must_use]
    pub fn events_for(&self, case_id: Uuid) -> Vec<AuditEvent> {
        self.inner
            .state()
            .events
            .iter()
            .filter(|event| event.case_id == Some(case_id))
            .cloned()
            .collect()
    }

    /// Committed outbound messages, in commit order.
    #[must_use]
    pub fn outbound(&self) -> Vec<OutboundMessage> {
        self.inner.state().outbound.clone()
    }

    /// Committed outbound messages of one type.
    #[must_use]
    pub fn outbound_of(&self, event_type: OutboundEventType) -> Vec<OutboundMessage> {
        self.inner
            .state()
            .outbound
            .iter()
            .filter(|message| message.event.event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Outbox records not yet published.
    #[must_use]
    pub fn pending_outbox(&self) -> usize {
        self.inner
            .state()
            .outbox
            .iter()
            .filter(|entry| !entry.published)
            .count()
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks so far, including failed commits.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

impl CaseStore for InMemoryCaseStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        let tx = InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            cases: HashMap::new(),
            links: HashMap::new(),
            events: Vec::new(),
            outbound: Vec::new(),
            locked: HashSet::new(),
            guards: Vec::new(),
        };
        Box::pin(async move { Ok(Box::new(tx) as Box<dyn StoreTransaction>) })
    }
}

impl OutboxStore for InMemoryCaseStore {
    fn claim_pending(&self, limit: usize, lease: std::time::Duration) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let now = Utc::now();
            let lease = chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let mut state = self.inner.state();
            let claimed = state
                .outbox
                .iter_mut()
                .filter(|entry| !entry.published && entry.leased_until.is_none_or(|until| until <= now))
                .take(limit)
                .map(|entry| {
                    entry.leased_until = Some(now + lease);
                    entry.record.clone()
                })
                .collect();
            Ok(claimed)
        })
    }

    fn mark_published(&self, ids: Vec<Uuid>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let ids: HashSet<Uuid> = ids.into_iter().collect();
            let mut state = self.inner.state();
            for entry in &mut state.outbox {
                if ids.contains(&entry.record.id) {
                    entry.published = true;
                }
            }
            Ok(())
        })
    }
}

struct InMemoryTransaction {
    inner: Arc<Inner>,
    cases: HashMap<Uuid, Case>,
    links: HashMap<String, UacQidLink>,
    events: Vec<AuditEvent>,
    outbound: Vec<OutboundMessage>,
    locked: HashSet<Uuid>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn read_case(&self, case_id: Uuid) -> Option<Case> {
        self.cases
            .get(&case_id)
            .cloned()
            .or_else(|| self.inner.state().cases.get(&case_id).cloned())
    }

    fn read_link(&self, qid: &str) -> Option<UacQidLink> {
        self.links
            .get(qid)
            .cloned()
            .or_else(|| self.inner.state().links.get(qid).cloned())
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn find_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move { Ok(self.read_case(case_id)) })
    }

    fn find_case_by_ref(&mut self, case_ref: i64) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move {
            if let Some(case) = self.cases.values().find(|case| case.case_ref == case_ref) {
                return Ok(Some(case.clone()));
            }
            Ok(self
                .inner
                .state()
                .cases
                .values()
                .find(|case| case.case_ref == case_ref)
                .cloned())
        })
    }

    fn lock_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move {
            if self.locked.insert(case_id) {
                let guard = self.inner.case_lock(case_id).lock_owned().await;
                self.guards.push(guard);
            }
            Ok(self.read_case(case_id))
        })
    }

    fn save_case(&mut self, case: Case) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.cases.insert(case.case_id, case);
            Ok(())
        })
    }

    fn next_case_sequence(&mut self) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.inner.sequence.fetch_add(1, Ordering::SeqCst)) })
    }

    fn find_link_by_qid<'a>(&'a mut self, qid: &'a str) -> StoreFuture<'a, Option<UacQidLink>> {
        Box::pin(async move { Ok(self.read_link(qid)) })
    }

    fn links_for_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Vec<UacQidLink>> {
        Box::pin(async move {
            let mut links: HashMap<String, UacQidLink> = self
                .inner
                .state()
                .links
                .values()
                .filter(|link| link.case_id == Some(case_id))
                .map(|link| (link.qid.clone(), link.clone()))
                .collect();
            for (qid, link) in &self.links {
                if link.case_id == Some(case_id) {
                    links.insert(qid.clone(), link.clone());
                } else {
                    links.remove(qid);
                }
            }
            Ok(links.into_values().collect())
        })
    }

    fn save_link(&mut self, link: UacQidLink) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if let Some(existing) = self.read_link(&link.qid) {
                if existing.id != link.id {
                    return Err(StoreError::Conflict(format!("QID {} already linked", link.qid)));
                }
            }
            self.links.insert(link.qid.clone(), link);
            Ok(())
        })
    }

    fn append_event(&mut self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.events.push(event);
            Ok(())
        })
    }

    fn enqueue_outbound(&mut self, message: OutboundMessage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.outbound.push(message);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let tx = *self;
            let injected = tx
                .inner
                .fail_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                tx.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::DatabaseError("injected commit failure".to_string()));
            }

            let now = Utc::now();
            let records = tx
                .outbound
                .iter()
                .map(|message| OutboxRecord::from_message(message, now))
                .collect::<Result<Vec<_>, _>>()?;

            {
                let mut state = tx.inner.state();
                state.cases.extend(tx.cases);
                state.links.extend(tx.links);
                state.events.extend(tx.events);
                state.outbound.extend(tx.outbound);
                state.outbox.extend(records.into_iter().map(|record| OutboxEntry {
                    record,
                    published: false,
                    leased_until: None,
                }));
            }
            tx.inner.commits.fetch_add(1, Ordering::SeqCst);
            drop(tx.guards);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
            drop(self);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::fixtures;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemoryCaseStore::new();
        let case = fixtures::household_case("E12000001");
        let case_id = case.case_id;

        let mut tx = store.begin().await.unwrap();
        tx.save_case(case).await.unwrap();
        assert!(tx.find_case(case_id).await.unwrap().is_some());
        assert!(store.case(case_id).is_none());

        tx.commit().await.unwrap();
        assert!(store.case(case_id).is_some());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryCaseStore::new();
        let case = fixtures::household_case("E12000001");
        let case_id = case.case_id;

        let mut tx = store.begin().await.unwrap();
        tx.save_case(case).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.case(case_id).is_none());
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn case_lock_is_held_until_commit() {
        let store = InMemoryCaseStore::new();
        let case = fixtures::ce_unit_case(5);
        let case_id = case.case_id;
        store.insert_case(case);

        let mut first = store.begin().await.unwrap();
        first.lock_case(case_id).await.unwrap();

        let waiting = store.clone();
        let second = tokio::spawn(async move {
            let mut tx = waiting.begin().await.unwrap();
            let case = tx.lock_case(case_id).await.unwrap().unwrap();
            tx.rollback().await.unwrap();
            case.ce_actual_responses
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        let mut case = store.case(case_id).unwrap();
        case.ce_actual_responses = 1;
        first.save_case(case).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_qid_is_a_conflict() {
        let store = InMemoryCaseStore::new();
        store.insert_link(fixtures::link("0120000000000001", None));

        let mut tx = store.begin().await.unwrap();
        let result = tx.save_link(fixtures::link("0120000000000001", None)).await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn claimed_records_are_leased() {
        let store = InMemoryCaseStore::new();
        let case = fixtures::household_case("E12000001");
        let message = OutboundMessage::case_event(OutboundEventType::CaseCreated, &case, Uuid::new_v4(), Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbound(message).await.unwrap();
        tx.commit().await.unwrap();

        let claimed = store.claim_pending(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_pending(10, Duration::from_secs(60)).await.unwrap().is_empty());

        store.mark_published(vec![claimed[0].id]).await.unwrap();
        assert_eq!(store.pending_outbox(), 0);
    }
}
