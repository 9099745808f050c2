//! Inbound message envelope and payloads.
//!
//! Every inbound message is JSON of the form
//!
//! ```json
//! {
//!   "event": {"type": "RESPONSE_RECEIVED", "source": "RECEIPT_SERVICE",
//!             "channel": "EQ", "dateTime": "2021-03-21T10:00:00Z",
//!             "transactionId": "..."},
//!   "payload": {"response": {"questionnaireId": "0120000000000001"}}
//! }
//! ```
//!
//! The event type selects both the payload key and the payload shape. Parsing
//! produces a closed [`InboundEvent`] so that dispatch is an exhaustive match.

use crate::model::{Address, AddressLevel, CaseType, RefusalType, UacQidPair};
use crate::patch::Patch;
use crate::questionnaire::QuestionnaireType;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Channel used by field work; field-originated events never produce field
/// instructions.
pub const FIELD_CHANNEL: &str = "FIELD";

/// Errors raised while parsing an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Body is not JSON of the envelope shape
    #[error("Invalid envelope: {0}")]
    InvalidJson(String),

    /// The payload key for the event type is absent
    #[error("Payload for {event_type} is missing '{key}'")]
    MissingPayload {
        /// Event type from the header
        event_type: EventType,
        /// Expected payload key
        key: &'static str,
    },

    /// Payload under the key has the wrong shape
    #[error("Invalid {key} payload: {reason}")]
    InvalidPayload {
        /// Payload key
        key: &'static str,
        /// Decoder message
        reason: String,
    },

    /// The event type is written by this service and never consumed
    #[error("{0} is not an inbound event type")]
    NotInbound(EventType),
}

/// Every event type that appears in envelopes or in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// New case from the sample file
    SampleLoaded,
    /// Bulk request for questionnaires not tied to a case
    UnaddressedRequested,
    /// UAC/QID pair created by RM for an existing case
    RmUacCreated,
    /// QID linked to a case
    QuestionnaireLinked,
    /// QID moved away from a case (audit only)
    QuestionnaireUnlinked,
    /// QID deactivated
    DeactivateUac,
    /// Questionnaire response
    ResponseReceived,
    /// Refusal to take part
    RefusalReceived,
    /// Request for materials
    FulfilmentRequested,
    /// Mail returned undelivered
    UndeliveredMailReported,
    /// Partial address update
    AddressModified,
    /// Address reported not valid
    AddressNotValid,
    /// Address retyped (e.g. household became communal establishment)
    AddressTypeChanged,
    /// Address not in the sample
    NewAddressReported,
    /// Reverses a previous invalid address report
    RmUninvalidateAddress,
    /// Field work updated a case
    FieldCaseUpdated,
    /// Census Coverage Survey listing
    CcsAddressListed,
    /// Online questionnaire launched
    SurveyLaunched,
    /// Respondent authenticated online
    RespondentAuthenticated,
}

impl EventType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SampleLoaded => "SAMPLE_LOADED",
            Self::UnaddressedRequested => "UNADDRESSED_REQUESTED",
            Self::RmUacCreated => "RM_UAC_CREATED",
            Self::QuestionnaireLinked => "QUESTIONNAIRE_LINKED",
            Self::QuestionnaireUnlinked => "QUESTIONNAIRE_UNLINKED",
            Self::DeactivateUac => "DEACTIVATE_UAC",
            Self::ResponseReceived => "RESPONSE_RECEIVED",
            Self::RefusalReceived => "REFUSAL_RECEIVED",
            Self::FulfilmentRequested => "FULFILMENT_REQUESTED",
            Self::UndeliveredMailReported => "UNDELIVERED_MAIL_REPORTED",
            Self::AddressModified => "ADDRESS_MODIFIED",
            Self::AddressNotValid => "ADDRESS_NOT_VALID",
            Self::AddressTypeChanged => "ADDRESS_TYPE_CHANGED",
            Self::NewAddressReported => "NEW_ADDRESS_REPORTED",
            Self::RmUninvalidateAddress => "RM_UNINVALIDATE_ADDRESS",
            Self::FieldCaseUpdated => "FIELD_CASE_UPDATED",
            Self::CcsAddressListed => "CCS_ADDRESS_LISTED",
            Self::SurveyLaunched => "SURVEY_LAUNCHED",
            Self::RespondentAuthenticated => "RESPONDENT_AUTHENTICATED",
        }
    }

    /// Key under `payload` that carries this event's body.
    #[must_use]
    pub const fn payload_key(&self) -> Option<&'static str> {
        match self {
            Self::SampleLoaded | Self::FieldCaseUpdated => Some("collectionCase"),
            Self::UnaddressedRequested => Some("unaddressedRequest"),
            Self::RmUacCreated => Some("uacQidCreated"),
            Self::QuestionnaireLinked | Self::DeactivateUac => Some("uac"),
            Self::ResponseReceived | Self::SurveyLaunched | Self::RespondentAuthenticated => {
                Some("response")
            },
            Self::RefusalReceived => Some("refusal"),
            Self::FulfilmentRequested => Some("fulfilmentRequest"),
            Self::UndeliveredMailReported => Some("fulfilmentInformation"),
            Self::AddressModified => Some("addressModification"),
            Self::AddressNotValid => Some("invalidAddress"),
            Self::AddressTypeChanged => Some("addressTypeChange"),
            Self::NewAddressReported => Some("newAddress"),
            Self::RmUninvalidateAddress => Some("rmUnInvalidateAddress"),
            Self::CcsAddressListed => Some("ccsProperty"),
            Self::QuestionnaireUnlinked => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound event families. Each family is consumed from its own topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    /// Sample loading
    Sample,
    /// Unaddressed questionnaire requests
    Unaddressed,
    /// UAC/QID lifecycle
    Uac,
    /// Questionnaire receipts
    Receipt,
    /// Refusals
    Refusal,
    /// Fulfilment requests and undelivered mail
    Fulfilment,
    /// Address changes
    Address,
    /// Field work updates
    Field,
    /// Census Coverage Survey listings
    Ccs,
    /// Online survey activity
    Survey,
}

impl EventFamily {
    /// All families, in topic configuration order.
    pub const ALL: [Self; 10] = [
        Self::Sample,
        Self::Unaddressed,
        Self::Uac,
        Self::Receipt,
        Self::Refusal,
        Self::Fulfilment,
        Self::Address,
        Self::Field,
        Self::Ccs,
        Self::Survey,
    ];

    /// Family name, used in topic names and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Unaddressed => "unaddressed",
            Self::Uac => "uac",
            Self::Receipt => "receipt",
            Self::Refusal => "refusal",
            Self::Fulfilment => "fulfilment",
            Self::Address => "address",
            Self::Field => "field",
            Self::Ccs => "ccs",
            Self::Survey => "survey",
        }
    }

    /// Event types accepted on this family's topic.
    #[must_use]
    pub const fn event_types(&self) -> &'static [EventType] {
        match self {
            Self::Sample => &[EventType::SampleLoaded],
            Self::Unaddressed => &[EventType::UnaddressedRequested],
            Self::Uac => &[
                EventType::RmUacCreated,
                EventType::QuestionnaireLinked,
                EventType::DeactivateUac,
            ],
            Self::Receipt => &[EventType::ResponseReceived],
            Self::Refusal => &[EventType::RefusalReceived],
            Self::Fulfilment => &[
                EventType::FulfilmentRequested,
                EventType::UndeliveredMailReported,
            ],
            Self::Address => &[
                EventType::AddressModified,
                EventType::AddressNotValid,
                EventType::AddressTypeChanged,
                EventType::NewAddressReported,
                EventType::RmUninvalidateAddress,
            ],
            Self::Field => &[EventType::FieldCaseUpdated],
            Self::Ccs => &[EventType::CcsAddressListed],
            Self::Survey => &[
                EventType::SurveyLaunched,
                EventType::RespondentAuthenticated,
            ],
        }
    }

    /// True if events of this type may arrive on this family's topic.
    #[must_use]
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.event_types().contains(&event_type)
    }

    /// Family an inbound event type belongs to.
    #[must_use]
    pub fn of(event_type: EventType) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.accepts(event_type))
    }
}

impl FromStr for EventFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.name() == s)
            .ok_or_else(|| format!("unknown event family '{s}'"))
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `event` section of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Originating service
    pub source: String,
    /// Originating channel (e.g. `EQ`, `FIELD`, `CC`)
    pub channel: String,
    /// When the event happened
    pub date_time: DateTime<Utc>,
    /// Correlates all messages caused by one action
    #[serde(default)]
    pub transaction_id: Option<Uuid>,
}

impl EventHeader {
    /// True if the event came from field work.
    #[must_use]
    pub fn is_field_channel(&self) -> bool {
        self.channel == FIELD_CHANNEL
    }
}

/// Reference to an existing case by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseIdRef {
    /// Case id
    pub id: Uuid,
}

/// `SAMPLE_LOADED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleCase {
    /// Id assigned by the sample loader
    pub case_id: Uuid,
    /// Case type
    pub case_type: CaseType,
    /// Address level
    pub address_level: AddressLevel,
    /// Region code
    pub region: String,
    /// Treatment code (selects questionnaires)
    pub treatment_code: String,
    /// Collection exercise
    #[serde(default)]
    pub collection_exercise_id: Option<Uuid>,
    /// Action plan
    #[serde(default)]
    pub action_plan_id: Option<Uuid>,
    /// Field coordinator
    #[serde(default)]
    pub field_coordinator_id: Option<String>,
    /// Field officer
    #[serde(default)]
    pub field_officer_id: Option<String>,
    /// Expected responses (CE only)
    #[serde(default)]
    pub ce_expected_capacity: Option<i32>,
    /// Hand delivery flag
    #[serde(default)]
    pub hand_delivery: bool,
    /// Address and geography
    #[serde(flatten)]
    pub address: Address,
}

/// `UNADDRESSED_REQUESTED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnaddressedRequest {
    /// Questionnaire type to issue
    pub questionnaire_type: QuestionnaireType,
    /// Print batch
    #[serde(default)]
    pub batch_id: Option<Uuid>,
}

/// `RM_UAC_CREATED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UacCreated {
    /// Access code
    pub uac: String,
    /// Questionnaire id
    pub qid: String,
    /// Case the pair was created for
    pub case_id: Uuid,
    /// Print batch
    #[serde(default)]
    pub batch_id: Option<Uuid>,
}

/// QID reference used by `QUESTIONNAIRE_LINKED` and `DEACTIVATE_UAC`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UacReference {
    /// Questionnaire id
    pub questionnaire_id: String,
    /// Case to link to
    #[serde(default)]
    pub case_id: Option<Uuid>,
    /// Individual case to link to, for individual forms on household cases
    #[serde(default)]
    pub individual_case_id: Option<Uuid>,
}

/// `RESPONSE_RECEIVED`, `SURVEY_LAUNCHED` and `RESPONDENT_AUTHENTICATED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Questionnaire id
    pub questionnaire_id: String,
    /// Case id, when the sender knows it
    #[serde(default)]
    pub case_id: Option<Uuid>,
    /// Blank questionnaire: reverses a receipt
    #[serde(default)]
    pub unreceipt: bool,
}

/// `REFUSAL_RECEIVED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refusal {
    /// Refusal severity
    #[serde(rename = "type")]
    pub refusal_type: RefusalType,
    /// Case refused
    pub collection_case: CaseIdRef,
    /// Agent recording the refusal
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// `FULFILMENT_REQUESTED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfilmentRequest {
    /// Product requested
    pub fulfilment_code: String,
    /// Case requesting
    pub case_id: Uuid,
    /// Id for the individual case, for individual response requests
    #[serde(default)]
    pub individual_case_id: Option<Uuid>,
    /// Pair issued by RM for SMS fulfilments
    #[serde(default)]
    pub uac_qid_created: Option<UacQidPair>,
}

/// `UNDELIVERED_MAIL_REPORTED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeliveredMail {
    /// Case reference printed on the mail
    #[serde(default)]
    pub case_ref: Option<String>,
    /// QID printed on the mail
    #[serde(default)]
    pub questionnaire_id: Option<String>,
    /// Product that was undeliverable
    #[serde(default)]
    pub fulfilment_code: Option<String>,
}

/// Partial address update. Absent keys leave the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressPatch {
    /// Address line 1 (may not be cleared)
    pub address_line1: Patch<String>,
    /// Address line 2
    pub address_line2: Patch<String>,
    /// Address line 3
    pub address_line3: Patch<String>,
    /// Town (may not be cleared)
    pub town_name: Patch<String>,
    /// Postcode (may not be cleared)
    pub postcode: Patch<String>,
    /// Organisation name
    pub organisation_name: Patch<String>,
    /// Establishment type
    pub estab_type: Patch<String>,
}

/// `ADDRESS_MODIFIED` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressModification {
    /// Case modified
    pub collection_case: CaseIdRef,
    /// Changes
    pub new_address: AddressPatch,
}

/// `ADDRESS_NOT_VALID` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidAddress {
    /// Reason reported
    pub reason: String,
    /// Case invalidated
    pub collection_case: CaseIdRef,
}

/// The old case and replacement details in an address type change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetypedCase {
    /// Old case id
    pub id: Uuid,
    /// Expected capacity for a new CE case
    #[serde(default)]
    pub ce_expected_capacity: Option<i32>,
    /// Address overrides; `addressType` is the new case type
    #[serde(default)]
    pub address: Address,
}

/// `ADDRESS_TYPE_CHANGED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTypeChange {
    /// Id for the replacement case
    pub new_case_id: Uuid,
    /// Old case and new details
    pub collection_case: RetypedCase,
}

/// Address of a reported or listed property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedAddress {
    /// Address level
    #[serde(default)]
    pub address_level: Option<AddressLevel>,
    /// Region code
    #[serde(default)]
    pub region: Option<String>,
    /// Address and geography
    #[serde(flatten)]
    pub address: Address,
}

/// A case described by `NEW_ADDRESS_REPORTED`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportedCase {
    /// Id for the new case
    pub id: Option<Uuid>,
    /// Case type, when different from the address type
    pub case_type: Option<CaseType>,
    /// Survey (`CENSUS` unless stated)
    pub survey: Option<String>,
    /// Collection exercise
    pub collection_exercise_id: Option<Uuid>,
    /// Field coordinator
    pub field_coordinator_id: Option<String>,
    /// Field officer
    pub field_officer_id: Option<String>,
    /// Expected responses (CE only)
    pub ce_expected_capacity: Option<i32>,
    /// Address
    pub address: ReportedAddress,
}

/// `NEW_ADDRESS_REPORTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAddress {
    /// Existing case to copy missing details from
    #[serde(default)]
    pub source_case_id: Option<Uuid>,
    /// The new case
    pub collection_case: ReportedCase,
}

/// `RM_UNINVALIDATE_ADDRESS` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninvalidateAddress {
    /// Case to restore
    pub case_id: Uuid,
}

/// `FIELD_CASE_UPDATED` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCaseUpdate {
    /// Case updated
    pub id: Uuid,
    /// New expected capacity
    #[serde(default)]
    pub ce_expected_capacity: Option<i32>,
}

/// Listing details of a CCS property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcsSampleUnit {
    /// Address level
    pub address_level: AddressLevel,
    /// Region code
    pub region: String,
    /// Field coordinator
    #[serde(default)]
    pub field_coordinator_id: Option<String>,
    /// Field officer
    #[serde(default)]
    pub field_officer_id: Option<String>,
    /// Address; `addressType` is the case type
    #[serde(flatten)]
    pub address: Address,
}

/// Questionnaire id listed by a CCS interviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedQuestionnaire {
    /// Questionnaire id
    pub questionnaire_id: String,
}

/// Refusal recorded during a CCS listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedRefusal {
    /// Refusal severity
    #[serde(rename = "type")]
    pub refusal_type: RefusalType,
}

/// Invalid address recorded during a CCS listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedInvalidAddress {
    /// Reason reported
    pub reason: String,
}

/// `CCS_ADDRESS_LISTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcsProperty {
    /// Id for the CCS case
    pub collection_case: CaseIdRef,
    /// Listed property
    pub sample_unit: CcsSampleUnit,
    /// Paper questionnaire left at the property
    #[serde(default)]
    pub uac: Option<ListedQuestionnaire>,
    /// Refusal encountered while listing
    #[serde(default)]
    pub refusal: Option<ListedRefusal>,
    /// Property found not to be a valid address
    #[serde(default)]
    pub invalid_address: Option<ListedInvalidAddress>,
    /// An interviewer questionnaire is required
    #[serde(default)]
    pub interview_required: bool,
}

/// A parsed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `SAMPLE_LOADED`
    SampleLoaded(SampleCase),
    /// `UNADDRESSED_REQUESTED`
    UnaddressedRequested(UnaddressedRequest),
    /// `RM_UAC_CREATED`
    UacCreated(UacCreated),
    /// `QUESTIONNAIRE_LINKED`
    QuestionnaireLinked(UacReference),
    /// `DEACTIVATE_UAC`
    DeactivateUac(UacReference),
    /// `RESPONSE_RECEIVED`
    ResponseReceived(Response),
    /// `REFUSAL_RECEIVED`
    RefusalReceived(Refusal),
    /// `FULFILMENT_REQUESTED`
    FulfilmentRequested(FulfilmentRequest),
    /// `UNDELIVERED_MAIL_REPORTED`
    UndeliveredMailReported(UndeliveredMail),
    /// `ADDRESS_MODIFIED`
    AddressModified(AddressModification),
    /// `ADDRESS_NOT_VALID`
    AddressNotValid(InvalidAddress),
    /// `ADDRESS_TYPE_CHANGED`
    AddressTypeChanged(AddressTypeChange),
    /// `NEW_ADDRESS_REPORTED`
    NewAddressReported(NewAddress),
    /// `RM_UNINVALIDATE_ADDRESS`
    UninvalidateAddress(UninvalidateAddress),
    /// `FIELD_CASE_UPDATED`
    FieldCaseUpdated(FieldCaseUpdate),
    /// `CCS_ADDRESS_LISTED`
    CcsAddressListed(CcsProperty),
    /// `SURVEY_LAUNCHED`
    SurveyLaunched(Response),
    /// `RESPONDENT_AUTHENTICATED`
    RespondentAuthenticated(Response),
}

impl InboundEvent {
    /// Decode the payload for `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the payload key is absent, the payload
    /// has the wrong shape, or the type is not consumed by this service.
    pub fn from_payload(
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<Self, EnvelopeError> {
        let Some(key) = event_type.payload_key() else {
            return Err(EnvelopeError::NotInbound(event_type));
        };
        let body = payload
            .get(key)
            .filter(|v| !v.is_null())
            .ok_or(EnvelopeError::MissingPayload { event_type, key })?;

        let event = match event_type {
            EventType::SampleLoaded => Self::SampleLoaded(decode(key, body)?),
            EventType::UnaddressedRequested => Self::UnaddressedRequested(decode(key, body)?),
            EventType::RmUacCreated => Self::UacCreated(decode(key, body)?),
            EventType::QuestionnaireLinked => Self::QuestionnaireLinked(decode(key, body)?),
            EventType::DeactivateUac => Self::DeactivateUac(decode(key, body)?),
            EventType::ResponseReceived => Self::ResponseReceived(decode(key, body)?),
            EventType::RefusalReceived => Self::RefusalReceived(decode(key, body)?),
            EventType::FulfilmentRequested => Self::FulfilmentRequested(decode(key, body)?),
            EventType::UndeliveredMailReported => {
                Self::UndeliveredMailReported(decode(key, body)?)
            },
            EventType::AddressModified => Self::AddressModified(decode(key, body)?),
            EventType::AddressNotValid => Self::AddressNotValid(decode(key, body)?),
            EventType::AddressTypeChanged => Self::AddressTypeChanged(decode(key, body)?),
            EventType::NewAddressReported => Self::NewAddressReported(decode(key, body)?),
            EventType::RmUninvalidateAddress => Self::UninvalidateAddress(decode(key, body)?),
            EventType::FieldCaseUpdated => Self::FieldCaseUpdated(decode(key, body)?),
            EventType::CcsAddressListed => Self::CcsAddressListed(decode(key, body)?),
            EventType::SurveyLaunched => Self::SurveyLaunched(decode(key, body)?),
            EventType::RespondentAuthenticated => {
                Self::RespondentAuthenticated(decode(key, body)?)
            },
            EventType::QuestionnaireUnlinked => return Err(EnvelopeError::NotInbound(event_type)),
        };
        Ok(event)
    }

    /// The event type this variant was decoded from.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::SampleLoaded(_) => EventType::SampleLoaded,
            Self::UnaddressedRequested(_) => EventType::UnaddressedRequested,
            Self::UacCreated(_) => EventType::RmUacCreated,
            Self::QuestionnaireLinked(_) => EventType::QuestionnaireLinked,
            Self::DeactivateUac(_) => EventType::DeactivateUac,
            Self::ResponseReceived(_) => EventType::ResponseReceived,
            Self::RefusalReceived(_) => EventType::RefusalReceived,
            Self::FulfilmentRequested(_) => EventType::FulfilmentRequested,
            Self::UndeliveredMailReported(_) => EventType::UndeliveredMailReported,
            Self::AddressModified(_) => EventType::AddressModified,
            Self::AddressNotValid(_) => EventType::AddressNotValid,
            Self::AddressTypeChanged(_) => EventType::AddressTypeChanged,
            Self::NewAddressReported(_) => EventType::NewAddressReported,
            Self::UninvalidateAddress(_) => EventType::RmUninvalidateAddress,
            Self::FieldCaseUpdated(_) => EventType::FieldCaseUpdated,
            Self::CcsAddressListed(_) => EventType::CcsAddressListed,
            Self::SurveyLaunched(_) => EventType::SurveyLaunched,
            Self::RespondentAuthenticated(_) => EventType::RespondentAuthenticated,
        }
    }
}

fn decode<T: DeserializeOwned>(key: &'static str, body: &serde_json::Value) -> Result<T, EnvelopeError> {
    serde_json::from_value(body.clone()).map_err(|e| EnvelopeError::InvalidPayload {
        key,
        reason: e.to_string(),
    })
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: EventHeader,
    payload: serde_json::Value,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event header
    pub header: EventHeader,
    /// Decoded payload
    pub event: InboundEvent,
    /// Raw payload, kept for the audit log
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Parse a raw message body.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the body is not a well-formed envelope
    /// for an inbound event type.
    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_slice(body).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        let event = InboundEvent::from_payload(raw.event.event_type, &raw.payload)?;
        Ok(Self {
            header: raw.event,
            event,
            payload: raw.payload,
        })
    }

    /// True if the body is JSON with an `event` header and a `payload`.
    ///
    /// Does not check that the payload matches the event type.
    #[must_use]
    pub fn is_well_formed(body: &[u8]) -> bool {
        serde_json::from_slice::<RawEnvelope>(body).is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": {
                "type": event_type,
                "source": "TEST",
                "channel": "EQ",
                "dateTime": "2021-03-21T10:00:00Z",
                "transactionId": "c45de4dc-3c3b-11e9-b210-d663bd873d93"
            },
            "payload": payload
        }))
        .unwrap()
    }

    #[test]
    fn parses_response_received() {
        let body = envelope(
            "RESPONSE_RECEIVED",
            json!({"response": {"questionnaireId": "0120000000000001", "unreceipt": true}}),
        );
        let parsed = Envelope::parse(&body).unwrap();
        assert_eq!(parsed.header.event_type, EventType::ResponseReceived);
        assert!(parsed.header.transaction_id.is_some());
        match parsed.event {
            InboundEvent::ResponseReceived(response) => {
                assert_eq!(response.questionnaire_id, "0120000000000001");
                assert!(response.unreceipt);
            },
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn address_modification_keeps_three_states() {
        let body = envelope(
            "ADDRESS_MODIFIED",
            json!({"addressModification": {
                "collectionCase": {"id": "3b6e1d22-02e4-4a37-8b43-3b6a0b0a0a01"},
                "newAddress": {"addressLine2": null, "townName": "Exeter"}
            }}),
        );
        let InboundEvent::AddressModified(modification) = Envelope::parse(&body).unwrap().event
        else {
            panic!("wrong variant");
        };
        assert!(modification.new_address.address_line1.is_absent());
        assert!(modification.new_address.address_line2.is_null());
        assert_eq!(
            modification.new_address.town_name,
            Patch::Value("Exeter".to_string())
        );
    }

    #[test]
    fn sample_address_is_flattened() {
        let body = envelope(
            "SAMPLE_LOADED",
            json!({"collectionCase": {
                "caseId": "3b6e1d22-02e4-4a37-8b43-3b6a0b0a0a01",
                "caseType": "HH",
                "addressLevel": "U",
                "region": "E1000",
                "treatmentCode": "HH_LF3R2E",
                "addressLine1": "1 Main Street",
                "postcode": "EX1 1AA"
            }}),
        );
        let InboundEvent::SampleLoaded(sample) = Envelope::parse(&body).unwrap().event else {
            panic!("wrong variant");
        };
        assert_eq!(sample.case_type, CaseType::Household);
        assert_eq!(sample.address.address_line1.as_deref(), Some("1 Main Street"));
        assert_eq!(sample.address.postcode.as_deref(), Some("EX1 1AA"));
    }

    #[test]
    fn missing_payload_key_is_an_error() {
        let body = envelope("REFUSAL_RECEIVED", json!({"response": {}}));
        assert!(matches!(
            Envelope::parse(&body),
            Err(EnvelopeError::MissingPayload { key: "refusal", .. })
        ));
    }

    #[test]
    fn audit_only_types_are_not_inbound() {
        let body = envelope("QUESTIONNAIRE_UNLINKED", json!({}));
        assert_eq!(
            Envelope::parse(&body),
            Err(EnvelopeError::NotInbound(EventType::QuestionnaireUnlinked))
        );
    }

    #[test]
    fn well_formed_check_ignores_payload_shape() {
        assert!(Envelope::is_well_formed(&envelope("SURVEY_LAUNCHED", json!({}))));
        assert!(!Envelope::is_well_formed(b"not json"));
        assert!(!Envelope::is_well_formed(br#"{"payload": {}}"#));
    }

    #[test]
    fn every_inbound_type_has_one_family() {
        for family in EventFamily::ALL {
            for event_type in family.event_types() {
                assert_eq!(EventFamily::of(*event_type), Some(family));
                assert!(event_type.payload_key().is_some());
            }
        }
        assert_eq!(EventFamily::of(EventType::QuestionnaireUnlinked), None);
        assert_eq!("address".parse::<EventFamily>(), Ok(EventFamily::Address));
    }
}
