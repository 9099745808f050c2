//! Outbound event shapes.
//!
//! Case and UAC updates go to the case-events topic; field instructions go to
//! the field topic. Messages are written to the outbox inside the processing
//! transaction and relayed to the broker afterwards.

use crate::hashing::sha256_hex;
use crate::model::{AddressLevel, Case, CaseType, RefusalType, UacQidLink};
use crate::questionnaire::{FormType, QuestionnaireType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source stamped on every outbound event.
pub const EVENT_SOURCE: &str = "CASE_SERVICE";

/// Channel stamped on every outbound event.
pub const EVENT_CHANNEL: &str = "RM";

/// Routing key for case updates.
pub const CASE_UPDATE_ROUTING_KEY: &str = "event.case.update";

/// Routing key for UAC updates.
pub const UAC_UPDATE_ROUTING_KEY: &str = "event.uac.update";

/// Routing key for field instructions.
pub const FIELD_ROUTING_KEY: &str = "event.fieldcase.update";

/// Header carrying the routing key on published records.
pub const ROUTING_KEY_HEADER: &str = "x-routing-key";

/// Logical destination of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Case and UAC events for downstream services
    CaseEvents,
    /// Instructions for field work
    Field,
}

impl Destination {
    /// Stable code used in the outbox table.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CaseEvents => "case_events",
            Self::Field => "field",
        }
    }

    /// Parse the outbox code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "case_events" => Some(Self::CaseEvents),
            "field" => Some(Self::Field),
            _ => None,
        }
    }
}

/// Outbound event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEventType {
    /// A case was created
    CaseCreated,
    /// A case changed
    CaseUpdated,
    /// A UAC/QID link was created or changed
    UacUpdated,
    /// Field work should create, update or cancel a job
    FieldCaseInstruction,
}

impl fmt::Display for OutboundEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CaseCreated => "CASE_CREATED",
            Self::CaseUpdated => "CASE_UPDATED",
            Self::UacUpdated => "UAC_UPDATED",
            Self::FieldCaseInstruction => "FIELD_CASE_INSTRUCTION",
        };
        f.write_str(name)
    }
}

/// Header of an outbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundHeader {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: OutboundEventType,
    /// Always [`EVENT_SOURCE`]
    pub source: String,
    /// Always [`EVENT_CHANNEL`]
    pub channel: String,
    /// When the event was produced
    pub date_time: DateTime<Utc>,
    /// Transaction id carried over from the inbound event
    pub transaction_id: Uuid,
}

impl OutboundHeader {
    /// Header for an event produced now.
    #[must_use]
    pub fn new(
        event_type: OutboundEventType,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            source: EVENT_SOURCE.to_string(),
            channel: EVENT_CHANNEL.to_string(),
            date_time: now,
            transaction_id,
        }
    }
}

/// Case address as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedAddress {
    /// Address line 1
    pub address_line1: Option<String>,
    /// Address line 2
    pub address_line2: Option<String>,
    /// Address line 3
    pub address_line3: Option<String>,
    /// Town
    pub town_name: Option<String>,
    /// Postcode
    pub postcode: Option<String>,
    /// Region
    pub region: String,
    /// Latitude
    pub latitude: Option<String>,
    /// Longitude
    pub longitude: Option<String>,
    /// UPRN
    pub uprn: Option<String>,
    /// Establishment UPRN
    pub estab_uprn: Option<String>,
    /// Address type
    pub address_type: Option<String>,
    /// Address level
    pub address_level: AddressLevel,
    /// Establishment type
    pub estab_type: Option<String>,
    /// Organisation name
    pub organisation_name: Option<String>,
}

/// `payload.collectionCase` of case events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCase {
    /// Case id
    pub id: Uuid,
    /// Case reference, as text
    pub case_ref: String,
    /// Case type
    pub case_type: CaseType,
    /// Survey
    pub survey: String,
    /// Collection exercise
    pub collection_exercise_id: Option<Uuid>,
    /// Action plan
    pub action_plan_id: Option<Uuid>,
    /// Treatment code
    pub treatment_code: Option<String>,
    /// Address
    pub address: PublishedAddress,
    /// Receipted
    pub receipt_received: bool,
    /// Refusal, if any
    pub refusal_received: Option<RefusalType>,
    /// Address invalid
    pub address_invalid: bool,
    /// Undelivered as addressed
    pub undelivered_as_addressed: bool,
    /// Hand delivery
    pub hand_delivery: bool,
    /// Skeleton
    pub skeleton: bool,
    /// Survey launched
    pub survey_launched: bool,
    /// Expected responses
    pub ce_expected_capacity: Option<i32>,
    /// Responses received
    pub ce_actual_responses: i32,
    /// Field coordinator
    pub field_coordinator_id: Option<String>,
    /// Field officer
    pub field_officer_id: Option<String>,
    /// Creation time
    pub created_date_time: DateTime<Utc>,
    /// Last update time
    pub last_updated: DateTime<Utc>,
}

impl From<&Case> for CollectionCase {
    fn from(case: &Case) -> Self {
        let address = &case.address;
        Self {
            id: case.case_id,
            case_ref: case.case_ref.to_string(),
            case_type: case.case_type,
            survey: case.survey.clone(),
            collection_exercise_id: case.collection_exercise_id,
            action_plan_id: case.action_plan_id,
            treatment_code: case.treatment_code.clone(),
            address: PublishedAddress {
                address_line1: address.address_line1.clone(),
                address_line2: address.address_line2.clone(),
                address_line3: address.address_line3.clone(),
                town_name: address.town_name.clone(),
                postcode: address.postcode.clone(),
                region: case.region.clone(),
                latitude: address.latitude.clone(),
                longitude: address.longitude.clone(),
                uprn: address.uprn.clone(),
                estab_uprn: address.estab_uprn.clone(),
                address_type: address.address_type.clone(),
                address_level: case.address_level,
                estab_type: address.estab_type.clone(),
                organisation_name: address.organisation_name.clone(),
            },
            receipt_received: case.receipt_received,
            refusal_received: case.refusal_received,
            address_invalid: case.address_invalid,
            undelivered_as_addressed: case.undelivered_as_addressed,
            hand_delivery: case.hand_delivery,
            skeleton: case.skeleton,
            survey_launched: case.survey_launched,
            ce_expected_capacity: case.ce_expected_capacity,
            ce_actual_responses: case.ce_actual_responses,
            field_coordinator_id: case.field_coordinator_id.clone(),
            field_officer_id: case.field_officer_id.clone(),
            created_date_time: case.created_at,
            last_updated: case.last_updated_at,
        }
    }
}

/// `payload.uac` of UAC events. The access code itself is never published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedUac {
    /// SHA-256 hex of the access code
    pub uac_hash: String,
    /// Usable for a response
    pub active: bool,
    /// Questionnaire id
    pub questionnaire_id: String,
    /// Linked case
    pub case_id: Option<Uuid>,
    /// Linked case type
    pub case_type: Option<CaseType>,
    /// Linked case region
    pub region: Option<String>,
    /// Form type, when the QID prefix is recognised
    pub form_type: Option<FormType>,
    /// Print batch
    pub batch_id: Option<Uuid>,
}

impl PublishedUac {
    /// Build from a link and its case, if linked.
    #[must_use]
    pub fn new(link: &UacQidLink, case: Option<&Case>) -> Self {
        Self {
            uac_hash: sha256_hex(&link.uac),
            active: link.active,
            questionnaire_id: link.qid.clone(),
            case_id: link.case_id,
            case_type: case.map(|c| c.case_type),
            region: case.map(|c| c.region.clone()),
            form_type: QuestionnaireType::from_qid(&link.qid)
                .ok()
                .map(QuestionnaireType::form_type),
            batch_id: link.batch_id,
        }
    }
}

/// Field work action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldAction {
    /// Create a field job
    Create,
    /// Update an existing job
    Update,
    /// Cancel the job
    Cancel,
}

/// `payload.fieldInstruction` of field events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInstruction {
    /// What field should do
    pub action_instruction: FieldAction,
    /// Case id
    pub case_id: Uuid,
    /// Case reference, as text
    pub case_ref: String,
    /// Survey
    pub survey_name: String,
    /// Case type
    pub address_type: CaseType,
    /// Address level
    pub address_level: AddressLevel,
    /// Establishment type
    pub estab_type: Option<String>,
    /// Organisation name
    pub organisation_name: Option<String>,
    /// Address line 1
    pub address_line1: Option<String>,
    /// Address line 2
    pub address_line2: Option<String>,
    /// Address line 3
    pub address_line3: Option<String>,
    /// Town
    pub town_name: Option<String>,
    /// Postcode
    pub postcode: Option<String>,
    /// Latitude
    pub latitude: Option<String>,
    /// Longitude
    pub longitude: Option<String>,
    /// UPRN
    pub uprn: Option<String>,
    /// Establishment UPRN
    pub estab_uprn: Option<String>,
    /// Output area
    pub oa: Option<String>,
    /// Field coordinator
    pub field_coordinator_id: Option<String>,
    /// Field officer
    pub field_officer_id: Option<String>,
    /// Expected responses
    pub ce_expected_capacity: Option<i32>,
    /// Responses received
    pub ce_actual_responses: i32,
    /// Mail returned undelivered
    pub undelivered_as_address: bool,
    /// Hand delivery
    pub hand_delivery: bool,
}

impl FieldInstruction {
    /// Instruction for a case.
    #[must_use]
    pub fn new(action: FieldAction, case: &Case) -> Self {
        let address = &case.address;
        Self {
            action_instruction: action,
            case_id: case.case_id,
            case_ref: case.case_ref.to_string(),
            survey_name: case.survey.clone(),
            address_type: case.case_type,
            address_level: case.address_level,
            estab_type: address.estab_type.clone(),
            organisation_name: address.organisation_name.clone(),
            address_line1: address.address_line1.clone(),
            address_line2: address.address_line2.clone(),
            address_line3: address.address_line3.clone(),
            town_name: address.town_name.clone(),
            postcode: address.postcode.clone(),
            latitude: address.latitude.clone(),
            longitude: address.longitude.clone(),
            uprn: address.uprn.clone(),
            estab_uprn: address.estab_uprn.clone(),
            oa: address.oa.clone(),
            field_coordinator_id: case.field_coordinator_id.clone(),
            field_officer_id: case.field_officer_id.clone(),
            ce_expected_capacity: case.ce_expected_capacity,
            ce_actual_responses: case.ce_actual_responses,
            undelivered_as_address: case.undelivered_as_addressed,
            hand_delivery: case.hand_delivery,
        }
    }
}

/// Outbound payload; serializes as `{"collectionCase": ...}`,
/// `{"uac": ...}` or `{"fieldInstruction": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundPayload {
    /// Case event body
    CollectionCase(Box<CollectionCase>),
    /// UAC event body
    Uac(PublishedUac),
    /// Field instruction body
    FieldInstruction(Box<FieldInstruction>),
}

/// A complete outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Header
    pub event: OutboundHeader,
    /// Body
    pub payload: OutboundPayload,
}

/// An outbound event with its routing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Logical topic
    pub destination: Destination,
    /// Routing key header
    pub routing_key: &'static str,
    /// Partition key (case id or QID)
    pub key: String,
    /// Event
    pub event: OutboundEvent,
}

impl OutboundMessage {
    /// `CASE_CREATED` or `CASE_UPDATED` for a case.
    #[must_use]
    pub fn case_event(
        event_type: OutboundEventType,
        case: &Case,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            destination: Destination::CaseEvents,
            routing_key: CASE_UPDATE_ROUTING_KEY,
            key: case.case_id.to_string(),
            event: OutboundEvent {
                event: OutboundHeader::new(event_type, transaction_id, now),
                payload: OutboundPayload::CollectionCase(Box::new(CollectionCase::from(case))),
            },
        }
    }

    /// `UAC_UPDATED` for a link.
    #[must_use]
    pub fn uac_updated(
        link: &UacQidLink,
        case: Option<&Case>,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            destination: Destination::CaseEvents,
            routing_key: UAC_UPDATE_ROUTING_KEY,
            key: link.qid.clone(),
            event: OutboundEvent {
                event: OutboundHeader::new(OutboundEventType::UacUpdated, transaction_id, now),
                payload: OutboundPayload::Uac(PublishedUac::new(link, case)),
            },
        }
    }

    /// Field instruction for a case.
    #[must_use]
    pub fn field_instruction(
        action: FieldAction,
        case: &Case,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            destination: Destination::Field,
            routing_key: FIELD_ROUTING_KEY,
            key: case.case_id.to_string(),
            event: OutboundEvent {
                event: OutboundHeader::new(
                    OutboundEventType::FieldCaseInstruction,
                    transaction_id,
                    now,
                ),
                payload: OutboundPayload::FieldInstruction(Box::new(FieldInstruction::new(
                    action, case,
                ))),
            },
        }
    }

    /// Event type of the wrapped event.
    #[must_use]
    pub const fn event_type(&self) -> OutboundEventType {
        self.event.event.event_type
    }

    /// Serialized JSON body.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.event)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::model::UacQidPair;

    fn case() -> Case {
        let mut case = Case::new(
            Uuid::new_v4(),
            CaseType::Household,
            AddressLevel::Unit,
            "E1000",
            Utc::now(),
        );
        case.case_ref = 12_345_678;
        case
    }

    #[test]
    fn case_event_has_collection_case_payload() {
        let case = case();
        let message = OutboundMessage::case_event(
            OutboundEventType::CaseCreated,
            &case,
            Uuid::new_v4(),
            Utc::now(),
        );
        let json: serde_json::Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();

        assert_eq!(message.routing_key, CASE_UPDATE_ROUTING_KEY);
        assert_eq!(json["event"]["type"], "CASE_CREATED");
        assert_eq!(json["event"]["source"], EVENT_SOURCE);
        assert_eq!(json["event"]["channel"], EVENT_CHANNEL);
        assert_eq!(json["payload"]["collectionCase"]["caseRef"], "12345678");
        assert_eq!(json["payload"]["collectionCase"]["address"]["region"], "E1000");
    }

    #[test]
    fn uac_event_publishes_hash_not_code() {
        let case = case();
        let link = UacQidLink::new(
            UacQidPair {
                uac: "secret-uac".into(),
                qid: "0120000000000001".into(),
            },
            Some(case.case_id),
            Utc::now(),
        );
        let message = OutboundMessage::uac_updated(&link, Some(&case), Uuid::new_v4(), Utc::now());
        let body = String::from_utf8(message.to_json().unwrap()).unwrap();

        assert!(!body.contains("secret-uac"));
        assert!(body.contains(&sha256_hex("secret-uac")));
        assert_eq!(message.routing_key, UAC_UPDATE_ROUTING_KEY);
        assert_eq!(message.key, "0120000000000001");
    }

    #[test]
    fn field_instruction_routes_to_field() {
        let message = OutboundMessage::field_instruction(
            FieldAction::Cancel,
            &case(),
            Uuid::new_v4(),
            Utc::now(),
        );
        let json: serde_json::Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();
        assert_eq!(message.destination, Destination::Field);
        assert_eq!(json["payload"]["fieldInstruction"]["actionInstruction"], "CANCEL");
    }

    #[test]
    fn destination_codes_round_trip() {
        for destination in [Destination::CaseEvents, Destination::Field] {
            assert_eq!(Destination::from_code(destination.as_str()), Some(destination));
        }
    }
}
