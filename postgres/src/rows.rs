//! Row decoding.

use census_rm_core::error::StoreError;
use census_rm_core::model::{Address, Case, RefusalType, UacQidLink};
use census_rm_core::outbound::Destination;
use census_rm_core::store::OutboxRecord;
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use std::str::FromStr;

pub(crate) const CASE_COLUMNS: &str = r"
    case_id, case_ref, case_type, address_level, region, address, treatment_code, survey,
    collection_exercise_id, action_plan_id, field_coordinator_id, field_officer_id,
    ce_expected_capacity, ce_actual_responses, skeleton, receipt_received, refusal_received,
    address_invalid, undelivered_as_addressed, hand_delivery, survey_launched,
    created_at, last_updated_at
";

pub(crate) const LINK_COLUMNS: &str = r"
    id, qid, uac, case_id, active, receipted, blank_questionnaire, ccs_case, batch_id,
    created_at, last_updated_at
";

fn parse<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value: String = row.get(column);
    value
        .parse()
        .map_err(|e: T::Err| StoreError::SerializationError(format!("{column}: {e}")))
}

pub(crate) fn case_from_row(row: &PgRow) -> Result<Case, StoreError> {
    let Json(address): Json<Address> = row
        .try_get("address")
        .map_err(|e| StoreError::SerializationError(format!("address: {e}")))?;
    let refusal_received: Option<String> = row.get("refusal_received");
    let refusal_received = refusal_received
        .map(|code| code.parse::<RefusalType>())
        .transpose()
        .map_err(|e| StoreError::SerializationError(format!("refusal_received: {e}")))?;

    Ok(Case {
        case_id: row.get("case_id"),
        case_ref: row.get("case_ref"),
        case_type: parse(row, "case_type")?,
        address_level: parse(row, "address_level")?,
        region: row.get("region"),
        address,
        treatment_code: row.get("treatment_code"),
        survey: row.get("survey"),
        collection_exercise_id: row.get("collection_exercise_id"),
        action_plan_id: row.get("action_plan_id"),
        field_coordinator_id: row.get("field_coordinator_id"),
        field_officer_id: row.get("field_officer_id"),
        ce_expected_capacity: row.get("ce_expected_capacity"),
        ce_actual_responses: row.get("ce_actual_responses"),
        skeleton: row.get("skeleton"),
        receipt_received: row.get("receipt_received"),
        refusal_received,
        address_invalid: row.get("address_invalid"),
        undelivered_as_addressed: row.get("undelivered_as_addressed"),
        hand_delivery: row.get("hand_delivery"),
        survey_launched: row.get("survey_launched"),
        created_at: row.get("created_at"),
        last_updated_at: row.get("last_updated_at"),
    })
}

pub(crate) fn link_from_row(row: &PgRow) -> UacQidLink {
    UacQidLink {
        id: row.get("id"),
        qid: row.get("qid"),
        uac: row.get("uac"),
        case_id: row.get("case_id"),
        active: row.get("active"),
        receipted: row.get("receipted"),
        blank_questionnaire: row.get("blank_questionnaire"),
        ccs_case: row.get("ccs_case"),
        batch_id: row.get("batch_id"),
        created_at: row.get("created_at"),
        last_updated_at: row.get("last_updated_at"),
    }
}

pub(crate) fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let code: String = row.get("destination");
    let destination = Destination::from_code(&code)
        .ok_or_else(|| StoreError::SerializationError(format!("Unknown destination: {code}")))?;

    Ok(OutboxRecord {
        id: row.get("id"),
        destination,
        routing_key: row.get("routing_key"),
        key: row.get("message_key"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    })
}
