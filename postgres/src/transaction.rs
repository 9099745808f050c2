//! One unit of work against the case database.

use crate::rows::{CASE_COLUMNS, LINK_COLUMNS, case_from_row, link_from_row};
use crate::write_error;
use census_rm_core::error::StoreError;
use census_rm_core::event_log::AuditEvent;
use census_rm_core::model::{Case, UacQidLink};
use census_rm_core::outbound::OutboundMessage;
use census_rm_core::store::{OutboxRecord, StoreFuture, StoreTransaction};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// A live `PostgreSQL` transaction.
///
/// Dropping it without calling [`StoreTransaction::commit`] rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    pub(crate) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    async fn select_case(&mut self, filter: &str, case_id: Uuid) -> Result<Option<Case>, StoreError> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE case_id = $1 {filter}");
        let row = sqlx::query(&sql)
            .bind(case_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        row.as_ref().map(case_from_row).transpose()
    }
}

impl StoreTransaction for PostgresTransaction {
    fn find_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move { self.select_case("", case_id).await })
    }

    fn find_case_by_ref(&mut self, case_ref: i64) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move {
            let sql = format!("SELECT {CASE_COLUMNS} FROM cases WHERE case_ref = $1");
            let row = sqlx::query(&sql)
                .bind(case_ref)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            row.as_ref().map(case_from_row).transpose()
        })
    }

    fn lock_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Option<Case>> {
        Box::pin(async move { self.select_case("FOR UPDATE", case_id).await })
    }

    fn save_case(&mut self, case: Case) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO cases (
                    case_id, case_ref, case_type, address_level, region, address,
                    treatment_code, survey, collection_exercise_id, action_plan_id,
                    field_coordinator_id, field_officer_id, ce_expected_capacity,
                    ce_actual_responses, skeleton, receipt_received, refusal_received,
                    address_invalid, undelivered_as_addressed, hand_delivery,
                    survey_launched, created_at, last_updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23
                )
                ON CONFLICT (case_id) DO UPDATE SET
                    case_type = EXCLUDED.case_type,
                    address_level = EXCLUDED.address_level,
                    region = EXCLUDED.region,
                    address = EXCLUDED.address,
                    treatment_code = EXCLUDED.treatment_code,
                    survey = EXCLUDED.survey,
                    collection_exercise_id = EXCLUDED.collection_exercise_id,
                    action_plan_id = EXCLUDED.action_plan_id,
                    field_coordinator_id = EXCLUDED.field_coordinator_id,
                    field_officer_id = EXCLUDED.field_officer_id,
                    ce_expected_capacity = EXCLUDED.ce_expected_capacity,
                    ce_actual_responses = EXCLUDED.ce_actual_responses,
                    skeleton = EXCLUDED.skeleton,
                    receipt_received = EXCLUDED.receipt_received,
                    refusal_received = EXCLUDED.refusal_received,
                    address_invalid = EXCLUDED.address_invalid,
                    undelivered_as_addressed = EXCLUDED.undelivered_as_addressed,
                    hand_delivery = EXCLUDED.hand_delivery,
                    survey_launched = EXCLUDED.survey_launched,
                    last_updated_at = EXCLUDED.last_updated_at
                ",
            )
            .bind(case.case_id)
            .bind(case.case_ref)
            .bind(case.case_type.as_str())
            .bind(case.address_level.as_str())
            .bind(&case.region)
            .bind(Json(&case.address))
            .bind(&case.treatment_code)
            .bind(&case.survey)
            .bind(case.collection_exercise_id)
            .bind(case.action_plan_id)
            .bind(&case.field_coordinator_id)
            .bind(&case.field_officer_id)
            .bind(case.ce_expected_capacity)
            .bind(case.ce_actual_responses)
            .bind(case.skeleton)
            .bind(case.receipt_received)
            .bind(case.refusal_received.map(|refusal| refusal.as_str()))
            .bind(case.address_invalid)
            .bind(case.undelivered_as_addressed)
            .bind(case.hand_delivery)
            .bind(case.survey_launched)
            .bind(case.created_at)
            .bind(case.last_updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(write_error)?;

            Ok(())
        })
    }

    fn next_case_sequence(&mut self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let (value,): (i64,) = sqlx::query_as("SELECT nextval('case_ref_seq')")
                .fetch_one(&mut *self.tx)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            u64::try_from(value)
                .map_err(|_| StoreError::SerializationError(format!("Negative case sequence: {value}")))
        })
    }

    fn find_link_by_qid<'a>(&'a mut self, qid: &'a str) -> StoreFuture<'a, Option<UacQidLink>> {
        Box::pin(async move {
            let sql = format!("SELECT {LINK_COLUMNS} FROM uac_qid_links WHERE qid = $1");
            let row = sqlx::query(&sql)
                .bind(qid)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            Ok(row.as_ref().map(link_from_row))
        })
    }

    fn links_for_case(&mut self, case_id: Uuid) -> StoreFuture<'_, Vec<UacQidLink>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM uac_qid_links WHERE case_id = $1 ORDER BY created_at"
            );
            let rows = sqlx::query(&sql)
                .bind(case_id)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            Ok(rows.iter().map(link_from_row).collect())
        })
    }

    fn save_link(&mut self, link: UacQidLink) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO uac_qid_links (
                    id, qid, uac, case_id, active, receipted, blank_questionnaire,
                    ccs_case, batch_id, created_at, last_updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE SET
                    case_id = EXCLUDED.case_id,
                    active = EXCLUDED.active,
                    receipted = EXCLUDED.receipted,
                    blank_questionnaire = EXCLUDED.blank_questionnaire,
                    ccs_case = EXCLUDED.ccs_case,
                    batch_id = EXCLUDED.batch_id,
                    last_updated_at = EXCLUDED.last_updated_at
                ",
            )
            .bind(link.id)
            .bind(&link.qid)
            .bind(&link.uac)
            .bind(link.case_id)
            .bind(link.active)
            .bind(link.receipted)
            .bind(link.blank_questionnaire)
            .bind(link.ccs_case)
            .bind(link.batch_id)
            .bind(link.created_at)
            .bind(link.last_updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(write_error)?;

            Ok(())
        })
    }

    fn append_event(&mut self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO events (
                    id, event_type, description, payload, channel, source,
                    transaction_id, event_date, processed_at, case_id, uac_qid_link_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ",
            )
            .bind(event.id)
            .bind(event.event_type.as_str())
            .bind(&event.description)
            .bind(&event.payload)
            .bind(&event.channel)
            .bind(&event.source)
            .bind(event.transaction_id)
            .bind(event.event_date)
            .bind(event.processed_at)
            .bind(event.case_id)
            .bind(event.uac_qid_link_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            metrics::counter!("case_store.events.appended", "event_type" => event.event_type.as_str())
                .increment(1);
            Ok(())
        })
    }

    fn enqueue_outbound(&mut self, message: OutboundMessage) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let record = OutboxRecord::from_message(&message, Utc::now())?;
            sqlx::query(
                r"
                INSERT INTO outbox_messages (
                    id, destination, routing_key, message_key, payload, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(record.id)
            .bind(record.destination.as_str())
            .bind(&record.routing_key)
            .bind(&record.key)
            .bind(&record.payload)
            .bind(record.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(|e| StoreError::DatabaseError(format!("Failed to commit transaction: {e}")))
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx
                .rollback()
                .await
                .map_err(|e| StoreError::DatabaseError(format!("Failed to roll back transaction: {e}")))
        })
    }
}
