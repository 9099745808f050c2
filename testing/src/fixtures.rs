//! Test data: envelopes, cases and links.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use census_rm_core::envelope::EventType;
use census_rm_core::model::{AddressLevel, Case, CaseType, UacQidLink, UacQidPair};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

static NEXT_CASE_REF: AtomicI64 = AtomicI64::new(10_000_001);

/// 2021-03-21 10:00:00 UTC.
#[must_use]
pub fn census_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 3, 21, 10, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Envelope for an event from the online questionnaire channel.
#[must_use]
pub fn envelope(event_type: EventType, payload: Value) -> Vec<u8> {
    envelope_from(event_type, "EQ", payload)
}

/// Envelope for an event from a given channel.
#[must_use]
pub fn envelope_from(event_type: EventType, channel: &str, payload: Value) -> Vec<u8> {
    json!({
        "event": {
            "type": event_type.as_str(),
            "source": "TEST",
            "channel": channel,
            "dateTime": census_day().to_rfc3339(),
            "transactionId": Uuid::new_v4(),
        },
        "payload": payload,
    })
    .to_string()
    .into_bytes()
}

/// Case with a fresh id and case reference.
#[must_use]
pub fn case(case_type: CaseType, address_level: AddressLevel, region: &str) -> Case {
    let mut case = Case::new(Uuid::new_v4(), case_type, address_level, region, census_day());
    case.case_ref = NEXT_CASE_REF.fetch_add(1, Ordering::SeqCst);
    case.address.address_line1 = Some("1 Test Street".to_string());
    case.address.town_name = Some("Exampleton".to_string());
    case.address.postcode = Some("EX1 1AA".to_string());
    case.address.address_type = Some(case_type.as_str().to_string());
    case.address.uprn = Some(format!("1000{}", case.case_ref));
    case.address.latitude = Some("50.7".to_string());
    case.address.longitude = Some("-3.5".to_string());
    let country = region.chars().next().unwrap_or('E');
    case.treatment_code = Some(format!("{}_LF2R3A{country}", case_type.as_str()));
    case
}

/// Household case in `region`, ready for field work.
#[must_use]
pub fn household_case(region: &str) -> Case {
    let mut case = case(CaseType::Household, AddressLevel::Unit, region);
    case.field_coordinator_id = Some("coordinator".to_string());
    case.field_officer_id = Some("officer".to_string());
    case
}

/// CE unit case in England expecting `capacity` responses.
#[must_use]
pub fn ce_unit_case(capacity: i32) -> Case {
    let mut case = case(CaseType::CommunalEstablishment, AddressLevel::Unit, "E12000001");
    case.ce_expected_capacity = Some(capacity);
    case.address.estab_uprn = Some(format!("2000{}", case.case_ref));
    case.address.estab_type = Some("CARE HOME".to_string());
    case.field_coordinator_id = Some("coordinator".to_string());
    case.field_officer_id = Some("officer".to_string());
    case
}

/// Active link for `qid`, optionally attached to a case.
#[must_use]
pub fn link(qid: &str, case_id: Option<Uuid>) -> UacQidLink {
    UacQidLink::new(
        UacQidPair {
            uac: format!("uac-{qid}"),
            qid: qid.to_string(),
        },
        case_id,
        census_day(),
    )
}

/// `RESPONSE_RECEIVED` body for a QID.
#[must_use]
pub fn response(qid: &str) -> Vec<u8> {
    envelope(
        EventType::ResponseReceived,
        json!({"response": {"questionnaireId": qid}}),
    )
}

/// Blank questionnaire `RESPONSE_RECEIVED` body for a QID.
#[must_use]
pub fn blank_response(qid: &str) -> Vec<u8> {
    envelope_from(
        EventType::ResponseReceived,
        "PQRS",
        json!({"response": {"questionnaireId": qid, "unreceipt": true}}),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use census_rm_core::envelope::{Envelope, InboundEvent};

    #[test]
    fn response_envelope_parses() {
        let envelope = Envelope::parse(&response("0120000000000001")).unwrap();
        assert_eq!(envelope.header.channel, "EQ");
        assert!(matches!(envelope.event, InboundEvent::ResponseReceived(ref r) if !r.unreceipt));
    }

    #[test]
    fn case_refs_are_distinct() {
        let first = household_case("E12000001");
        let second = household_case("E12000001");
        assert_ne!(first.case_ref, second.case_ref);
        assert_ne!(first.case_id, second.case_id);
    }
}
