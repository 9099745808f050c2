//! Persistence abstractions.
//!
//! All state changes for one inbound message happen inside one
//! [`StoreTransaction`]: case and link writes, the audit record and the
//! outbound messages. Either everything commits or nothing does.
//!
//! # Implementations
//!
//! - `PostgresCaseStore` (in `census-rm-postgres`): production
//! - `InMemoryCaseStore` (in `census-rm-testing`): tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so stores can be shared as
//! `Arc<dyn CaseStore>` and transactions passed around as
//! `Box<dyn StoreTransaction>`.

use crate::error::StoreError;
use crate::event_log::AuditEvent;
use crate::model::{Case, UacQidLink};
use crate::outbound::{Destination, OutboundMessage};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Opens transactions.
pub trait CaseStore: Send + Sync {
    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if no connection is available.
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>>;
}

/// One unit of work.
///
/// Dropping a transaction without committing discards its writes.
pub trait StoreTransaction: Send {
    /// Load a case by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>>;

    /// Load a case by case reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_case_by_ref(&mut self, case_ref: i64) -> StoreFuture<'_, Option<Case>>;

    /// Load a case and hold an exclusive lock on it until the transaction
    /// ends. Concurrent lockers of the same case wait.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn lock_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>>;

    /// Insert or update a case.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn save_case(&mut self, case: Case) -> StoreFuture<'_, ()>;

    /// Next value of the case reference sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the sequence cannot be read.
    fn next_case_sequence(&mut self) -> StoreFuture<'_, u64>;

    /// Load a link by QID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_link_by_qid<'a>(&'a mut self, qid: &'a str) -> StoreFuture<'a, Option<UacQidLink>>;

    /// All links attached to a case.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn links_for_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Vec<UacQidLink>>;

    /// Insert or update a link.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if another link already owns the QID.
    fn save_link(&mut self, link: UacQidLink) -> StoreFuture<'_, ()>;

    /// Append an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn append_event(&mut self, event: AuditEvent) -> StoreFuture<'_, ()>;

    /// Queue an outbound message for publication after commit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the message cannot be serialized or written.
    fn enqueue_outbound(&mut self, message: OutboundMessage) -> StoreFuture<'_, ()>;

    /// Make all writes durable and release locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing is applied.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discard all writes and release locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rollback cannot be sent.
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Record id
    pub id: Uuid,
    /// Logical topic
    pub destination: Destination,
    /// Routing key header
    pub routing_key: String,
    /// Partition key
    pub key: String,
    /// JSON body
    pub payload: Vec<u8>,
    /// When the message was queued
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Serialize an outbound message for the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SerializationError`] if the event cannot be encoded.
    pub fn from_message(message: &OutboundMessage, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let payload = message
            .to_json()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            destination: message.destination,
            routing_key: message.routing_key.to_string(),
            key: message.key.clone(),
            payload,
            created_at: now,
        })
    }
}

/// Relay side of the transactional outbox.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` unpublished records, oldest first.
    ///
    /// A claimed record is not returned to another caller until `lease` has
    /// passed, so a crashed relay's records are eventually retried.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn claim_pending(
        &self,
        limit: usize,
        lease: std::time::Duration,
    ) -> StoreFuture<'_, Vec<OutboxRecord>>;

    /// Mark records as published.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_published(&self, ids: Vec<Uuid>) -> StoreFuture<'_, ()>;
}
