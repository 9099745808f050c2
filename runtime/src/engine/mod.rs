//! Event-to-state consistency engine.
//!
//! [`CaseProcessor::process`] applies one inbound message:
//!
//! 1. Parse the envelope into a closed [`InboundEvent`]
//! 2. Reject event types that do not belong to the consuming topic's family
//! 3. Open a store transaction
//! 4. Dispatch to the handler for the event type (exhaustive match)
//! 5. Commit, or roll back on any error
//!
//! Handlers mutate cases and links, append one audit record and queue
//! outbound events through the transaction, so a message is applied
//! completely or not at all. Errors are returned to the caller; there is no
//! in-process retry of business failures.

mod address;
mod blank_questionnaire;
mod ccs;
mod field;
mod fulfilment;
mod linking;
mod receipt;
mod refusal;
mod sample;
mod survey;
mod uac;

pub use address::{DUMMY_UPRN_PREFIX, retyped_address_level};
pub use blank_questionnaire::{BlankQuestionnaireKey, BlankQuestionnaireRule, blank_questionnaire_rule};
pub use field::is_eligible_for_field;

use crate::emitter::Emitter;
use crate::uac_cache::UacQidCache;
use census_rm_core::case_ref::CaseRefGenerator;
use census_rm_core::collaborators::{AddressIndex, NewAddressEnhanced};
use census_rm_core::environment::Clock;
use census_rm_core::envelope::{Envelope, EventFamily, EventHeader, EventType, InboundEvent};
use census_rm_core::error::ProcessingError;
use census_rm_core::event_log::AuditEvent;
use census_rm_core::model::{AddressLevel, Case, CaseType, UacQidLink};
use census_rm_core::outbound::FieldAction;
use census_rm_core::store::{CaseStore, StoreTransaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Applies inbound events to cases and UAC/QID links.
pub struct CaseProcessor {
    store: Arc<dyn CaseStore>,
    uac_cache: Arc<UacQidCache>,
    case_refs: Arc<CaseRefGenerator>,
    address_index: Arc<dyn AddressIndex>,
    clock: Arc<dyn Clock>,
}

impl CaseProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn CaseStore>,
        uac_cache: Arc<UacQidCache>,
        case_refs: Arc<CaseRefGenerator>,
        address_index: Arc<dyn AddressIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            uac_cache,
            case_refs,
            address_index,
            clock,
        }
    }

    /// Apply one raw message consumed from the `family` topic.
    ///
    /// Returns the event type that was applied.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError`] if the message is malformed, belongs to
    /// another family, violates a case invariant, or cannot be persisted. No
    /// state change survives an error.
    #[tracing::instrument(skip(self, body), fields(family = %family))]
    pub async fn process(&self, family: EventFamily, body: &[u8]) -> Result<EventType, ProcessingError> {
        let Envelope {
            header,
            event,
            payload,
        } = Envelope::parse(body).map_err(|e| ProcessingError::Malformed(e.to_string()))?;

        let event_type = event.event_type();
        if !family.accepts(event_type) {
            return Err(ProcessingError::UnexpectedEventType {
                event_type,
                family: family.name(),
            });
        }

        let mut tx = self.store.begin().await?;
        let now = self.clock.now();
        let (result, address_forwarded) = {
            let mut ctx = EventContext::new(tx.as_mut(), &header, &payload, now);
            let result = self.dispatch(&mut ctx, event).await;
            (result, ctx.address_forwarded)
        };

        match result {
            Ok(()) => {
                if let Err(e) = tx.commit().await {
                    warn_if_forwarded(address_forwarded, event_type);
                    return Err(e.into());
                }
                tracing::debug!(
                    event_type = %event_type,
                    transaction_id = ?header.transaction_id,
                    "Event applied"
                );
                Ok(event_type)
            },
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                warn_if_forwarded(address_forwarded, event_type);
                Err(e)
            },
        }
    }

    async fn dispatch(
        &self,
        ctx: &mut EventContext<'_>,
        event: InboundEvent,
    ) -> Result<(), ProcessingError> {
        match event {
            InboundEvent::SampleLoaded(sample) => sample::sample_loaded(self, ctx, sample).await,
            InboundEvent::UnaddressedRequested(request) => {
                uac::unaddressed_requested(self, ctx, request).await
            },
            InboundEvent::UacCreated(created) => uac::uac_created(ctx, created).await,
            InboundEvent::QuestionnaireLinked(reference) => {
                linking::questionnaire_linked(self, ctx, reference).await
            },
            InboundEvent::DeactivateUac(reference) => uac::deactivate_uac(ctx, reference).await,
            InboundEvent::ResponseReceived(response) => {
                if response.unreceipt {
                    blank_questionnaire::blank_questionnaire_received(ctx, response).await
                } else {
                    receipt::response_received(ctx, response).await
                }
            },
            InboundEvent::RefusalReceived(refusal) => refusal::refusal_received(ctx, refusal).await,
            InboundEvent::FulfilmentRequested(request) => {
                fulfilment::fulfilment_requested(self, ctx, request).await
            },
            InboundEvent::UndeliveredMailReported(report) => {
                fulfilment::undelivered_mail_reported(ctx, report).await
            },
            InboundEvent::AddressModified(modification) => {
                address::address_modified(ctx, modification).await
            },
            InboundEvent::AddressNotValid(invalid) => address::address_not_valid(ctx, invalid).await,
            InboundEvent::AddressTypeChanged(change) => {
                address::address_type_changed(self, ctx, change).await
            },
            InboundEvent::NewAddressReported(report) => {
                address::new_address_reported(self, ctx, report).await
            },
            InboundEvent::UninvalidateAddress(request) => {
                address::uninvalidate_address(ctx, request).await
            },
            InboundEvent::FieldCaseUpdated(update) => field::field_case_updated(ctx, update).await,
            InboundEvent::CcsAddressListed(property) => ccs::ccs_address_listed(self, ctx, property).await,
            InboundEvent::SurveyLaunched(response) => survey::survey_launched(ctx, response).await,
            InboundEvent::RespondentAuthenticated(response) => {
                survey::respondent_authenticated(ctx, response).await
            },
        }
    }

    /// Draw the next sequence number and assign the case reference.
    async fn assign_case_ref(
        &self,
        ctx: &mut EventContext<'_>,
        case: &mut Case,
    ) -> Result<(), ProcessingError> {
        let sequence = ctx.tx.next_case_sequence().await?;
        case.case_ref = self.case_refs.case_ref(sequence)?;
        Ok(())
    }

    /// Assign a case reference if needed, save the case and emit `CASE_CREATED`.
    async fn create_case(&self, ctx: &mut EventContext<'_>, mut case: Case) -> Result<Case, ProcessingError> {
        if case.case_ref == 0 {
            self.assign_case_ref(ctx, &mut case).await?;
        }
        ctx.save_case(&mut case).await?;
        ctx.case_created(&case).await?;
        tracing::info!(
            case_id = %case.case_id,
            case_ref = case.case_ref,
            case_type = %case.case_type,
            "Case created"
        );
        Ok(case)
    }

    /// Household individual case split from a household.
    async fn create_individual_case(
        &self,
        ctx: &mut EventContext<'_>,
        parent: &Case,
        case_id: Uuid,
    ) -> Result<Case, ProcessingError> {
        let mut individual = Case::new(
            case_id,
            CaseType::HouseholdIndividual,
            AddressLevel::Unit,
            parent.region.clone(),
            ctx.now,
        );
        individual.address = parent.address.clone();
        individual.treatment_code.clone_from(&parent.treatment_code);
        individual.survey.clone_from(&parent.survey);
        individual.collection_exercise_id = parent.collection_exercise_id;
        individual.action_plan_id = parent.action_plan_id;
        individual.field_coordinator_id.clone_from(&parent.field_coordinator_id);
        individual.field_officer_id.clone_from(&parent.field_officer_id);
        self.create_case(ctx, individual).await
    }

    /// Send a new address to the address index without waiting.
    ///
    /// The forward cannot be recalled if the transaction later rolls back.
    fn forward_new_address(&self, ctx: &mut EventContext<'_>, address: NewAddressEnhanced) {
        ctx.address_forwarded = true;
        let index = Arc::clone(&self.address_index);
        tokio::spawn(async move {
            let case_id = address.case_id;
            if let Err(e) = index.publish(address).await {
                tracing::error!(case_id = %case_id, error = %e, "Failed to publish new address to the address index");
            }
        });
    }
}

fn warn_if_forwarded(address_forwarded: bool, event_type: EventType) {
    if address_forwarded {
        tracing::warn!(
            event_type = %event_type,
            "Transaction rolled back after a new address was forwarded to the address index; \
             the index now holds an address with no case"
        );
    }
}

/// Per-message state shared by handlers.
pub(crate) struct EventContext<'a> {
    tx: &'a mut dyn StoreTransaction,
    header: &'a EventHeader,
    payload: &'a serde_json::Value,
    now: DateTime<Utc>,
    emitter: Emitter,
    address_forwarded: bool,
}

impl<'a> EventContext<'a> {
    fn new(
        tx: &'a mut dyn StoreTransaction,
        header: &'a EventHeader,
        payload: &'a serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tx,
            header,
            payload,
            now,
            emitter: Emitter::new(header.transaction_id, now),
            address_forwarded: false,
        }
    }

    async fn find_case(&mut self, case_id: Uuid) -> Result<Option<Case>, ProcessingError> {
        Ok(self.tx.find_case(case_id).await?)
    }

    async fn case(&mut self, case_id: Uuid) -> Result<Case, ProcessingError> {
        self.find_case(case_id)
            .await?
            .ok_or_else(|| ProcessingError::CaseNotFound(case_id.to_string()))
    }

    async fn locked_case(&mut self, case_id: Uuid) -> Result<Case, ProcessingError> {
        self.tx
            .lock_case(case_id)
            .await?
            .ok_or_else(|| ProcessingError::CaseNotFound(case_id.to_string()))
    }

    async fn link(&mut self, qid: &str) -> Result<UacQidLink, ProcessingError> {
        self.tx
            .find_link_by_qid(qid)
            .await?
            .ok_or_else(|| ProcessingError::QidNotFound(qid.to_string()))
    }

    async fn save_case(&mut self, case: &mut Case) -> Result<(), ProcessingError> {
        case.last_updated_at = self.now;
        self.tx.save_case(case.clone()).await?;
        Ok(())
    }

    async fn save_link(&mut self, link: &mut UacQidLink) -> Result<(), ProcessingError> {
        link.last_updated_at = self.now;
        self.tx.save_link(link.clone()).await?;
        Ok(())
    }

    /// Append the audit record for the inbound event.
    async fn audit(
        &mut self,
        description: impl Into<String>,
        case_id: Option<Uuid>,
        link_id: Option<Uuid>,
    ) -> Result<(), ProcessingError> {
        self.audit_as(self.header.event_type, description, case_id, link_id)
            .await
    }

    async fn audit_as(
        &mut self,
        event_type: EventType,
        description: impl Into<String>,
        case_id: Option<Uuid>,
        link_id: Option<Uuid>,
    ) -> Result<(), ProcessingError> {
        let mut event = AuditEvent::new(self.header, event_type, description, self.payload, self.now);
        event.case_id = case_id;
        event.uac_qid_link_id = link_id;
        self.tx.append_event(event).await?;
        Ok(())
    }

    async fn case_created(&mut self, case: &Case) -> Result<(), ProcessingError> {
        self.emitter.case_created(&mut *self.tx, case).await?;
        Ok(())
    }

    async fn case_updated(&mut self, case: &Case) -> Result<(), ProcessingError> {
        self.emitter.case_updated(&mut *self.tx, case).await?;
        Ok(())
    }

    async fn uac_updated(&mut self, link: &UacQidLink, case: Option<&Case>) -> Result<(), ProcessingError> {
        self.emitter.uac_updated(&mut *self.tx, link, case).await?;
        Ok(())
    }

    async fn field_instruction(&mut self, action: FieldAction, case: &Case) -> Result<(), ProcessingError> {
        self.emitter
            .field_instruction(&mut *self.tx, action, case)
            .await?;
        Ok(())
    }

    /// Emit a field instruction if the case is eligible; returns whether one
    /// was emitted.
    async fn field_instruction_if_eligible(
        &mut self,
        action: FieldAction,
        case: &Case,
    ) -> Result<bool, ProcessingError> {
        if !is_eligible_for_field(case, &self.header.channel) {
            tracing::debug!(case_id = %case.case_id, ?action, "Case not eligible for field work");
            return Ok(false);
        }
        self.field_instruction(action, case).await?;
        Ok(true)
    }
}
