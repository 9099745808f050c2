//! Outbound event emission.
//!
//! Handlers never publish directly. The [`Emitter`] builds the outbound
//! message and queues it in the transaction's outbox, so derived events are
//! committed or discarded together with the state change that caused them.
//! The outbox relay publishes them afterwards.

use census_rm_core::error::StoreError;
use census_rm_core::model::{Case, UacQidLink};
use census_rm_core::outbound::{FieldAction, OutboundEventType, OutboundMessage};
use census_rm_core::store::StoreTransaction;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Builds outbound messages for one inbound event.
#[derive(Debug, Clone, Copy)]
pub struct Emitter {
    transaction_id: Uuid,
    now: DateTime<Utc>,
}

impl Emitter {
    /// Emitter stamping messages with the inbound transaction id, or a fresh
    /// one when the inbound event carried none.
    #[must_use]
    pub fn new(transaction_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            transaction_id: transaction_id.unwrap_or_else(Uuid::new_v4),
            now,
        }
    }

    /// Transaction id stamped on every outbound message.
    #[must_use]
    pub const fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    /// Queue `CASE_CREATED`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox write fails.
    pub async fn case_created(
        &self,
        tx: &mut dyn StoreTransaction,
        case: &Case,
    ) -> Result<(), StoreError> {
        self.enqueue(
            tx,
            OutboundMessage::case_event(OutboundEventType::CaseCreated, case, self.transaction_id, self.now),
        )
        .await
    }

    /// Queue `CASE_UPDATED`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox write fails.
    pub async fn case_updated(
        &self,
        tx: &mut dyn StoreTransaction,
        case: &Case,
    ) -> Result<(), StoreError> {
        self.enqueue(
            tx,
            OutboundMessage::case_event(OutboundEventType::CaseUpdated, case, self.transaction_id, self.now),
        )
        .await
    }

    /// Queue `UAC_UPDATED`. Only the hash of the UAC leaves the service.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox write fails.
    pub async fn uac_updated(
        &self,
        tx: &mut dyn StoreTransaction,
        link: &UacQidLink,
        case: Option<&Case>,
    ) -> Result<(), StoreError> {
        self.enqueue(
            tx,
            OutboundMessage::uac_updated(link, case, self.transaction_id, self.now),
        )
        .await
    }

    /// Queue a field work instruction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox write fails.
    pub async fn field_instruction(
        &self,
        tx: &mut dyn StoreTransaction,
        action: FieldAction,
        case: &Case,
    ) -> Result<(), StoreError> {
        self.enqueue(
            tx,
            OutboundMessage::field_instruction(action, case, self.transaction_id, self.now),
        )
        .await
    }

    async fn enqueue(
        &self,
        tx: &mut dyn StoreTransaction,
        message: OutboundMessage,
    ) -> Result<(), StoreError> {
        tracing::debug!(
            event_type = %message.event_type(),
            destination = message.destination.as_str(),
            key = %message.key,
            transaction_id = %self.transaction_id,
            "Queued outbound event"
        );
        tx.enqueue_outbound(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_inbound_transaction_id() {
        let id = Uuid::new_v4();
        assert_eq!(Emitter::new(Some(id), Utc::now()).transaction_id(), id);
    }

    #[test]
    fn generates_transaction_id_when_absent() {
        let emitter = Emitter::new(None, Utc::now());
        assert!(!emitter.transaction_id().is_nil());
    }
}
