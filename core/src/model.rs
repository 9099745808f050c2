//! Case and UAC/QID link aggregates.
//!
//! A [`Case`] is one physical or administrative survey unit. A [`UacQidLink`]
//! binds a one-time access code to a questionnaire and, optionally, to a case.
//! Both are mutated exclusively by the consistency engine and are never
//! physically deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Survey name for census cases.
pub const CENSUS_SURVEY: &str = "CENSUS";

/// Survey name for Census Coverage Survey cases.
pub const CCS_SURVEY: &str = "CCS";

/// Establishment types that are never sent to field.
pub const TRANSIENT_ESTAB_TYPES: [&str; 3] =
    ["TRAVELLING PERSONS", "TRANSIENT PERSONS", "MIGRANT WORKERS"];

/// Error returned when a classification code cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownCode {
    /// What was being parsed (e.g. "case type")
    pub kind: &'static str,
    /// The offending value
    pub value: String,
}

/// Case type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseType {
    /// Household
    #[serde(rename = "HH")]
    Household,
    /// Household individual (an individual response split from a household)
    #[serde(rename = "HI")]
    HouseholdIndividual,
    /// Communal establishment
    #[serde(rename = "CE")]
    CommunalEstablishment,
    /// Special population group
    #[serde(rename = "SPG")]
    SpecialPopulationGroup,
}

impl CaseType {
    /// Wire/database code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Household => "HH",
            Self::HouseholdIndividual => "HI",
            Self::CommunalEstablishment => "CE",
            Self::SpecialPopulationGroup => "SPG",
        }
    }
}

impl FromStr for CaseType {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HH" => Ok(Self::Household),
            "HI" => Ok(Self::HouseholdIndividual),
            "CE" => Ok(Self::CommunalEstablishment),
            "SPG" => Ok(Self::SpecialPopulationGroup),
            other => Err(UnknownCode {
                kind: "case type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address level: whole establishment or a single unit within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressLevel {
    /// Establishment level
    #[serde(rename = "E")]
    Establishment,
    /// Unit level
    #[serde(rename = "U")]
    Unit,
}

impl AddressLevel {
    /// Wire/database code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Establishment => "E",
            Self::Unit => "U",
        }
    }
}

impl FromStr for AddressLevel {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "E" => Ok(Self::Establishment),
            "U" => Ok(Self::Unit),
            other => Err(UnknownCode {
                kind: "address level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refusal severity recorded against a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefusalType {
    /// Respondent declined to take part
    HardRefusal,
    /// Refusal under exceptional circumstances; outranks a hard refusal
    ExtraordinaryRefusal,
}

impl RefusalType {
    /// Wire/database code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HardRefusal => "HARD_REFUSAL",
            Self::ExtraordinaryRefusal => "EXTRAORDINARY_REFUSAL",
        }
    }
}

impl FromStr for RefusalType {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HARD_REFUSAL" => Ok(Self::HardRefusal),
            "EXTRAORDINARY_REFUSAL" => Ok(Self::ExtraordinaryRefusal),
            other => Err(UnknownCode {
                kind: "refusal type",
                value: other.to_string(),
            }),
        }
    }
}

/// Postal address and geography of a case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Address line 1
    pub address_line1: Option<String>,
    /// Address line 2
    pub address_line2: Option<String>,
    /// Address line 3
    pub address_line3: Option<String>,
    /// Post town
    pub town_name: Option<String>,
    /// Postcode
    pub postcode: Option<String>,
    /// Latitude (decimal degrees, kept as text as received)
    pub latitude: Option<String>,
    /// Longitude (decimal degrees, kept as text as received)
    pub longitude: Option<String>,
    /// Unique property reference number
    pub uprn: Option<String>,
    /// Establishment UPRN (CE/SPG)
    pub estab_uprn: Option<String>,
    /// Organisation name
    pub organisation_name: Option<String>,
    /// Establishment type (e.g. "CARE HOME")
    pub estab_type: Option<String>,
    /// Address type code as received (HH, CE, SPG)
    pub address_type: Option<String>,
    /// Address base classification
    pub abp_code: Option<String>,
    /// Output area
    pub oa: Option<String>,
    /// Lower super output area
    pub lsoa: Option<String>,
    /// Middle super output area
    pub msoa: Option<String>,
    /// Local authority district
    pub lad: Option<String>,
}

impl Address {
    /// Overwrite fields with every value present in `update`.
    pub fn overlay(&mut self, update: Self) {
        fn set(target: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *target = value;
            }
        }
        set(&mut self.address_line1, update.address_line1);
        set(&mut self.address_line2, update.address_line2);
        set(&mut self.address_line3, update.address_line3);
        set(&mut self.town_name, update.town_name);
        set(&mut self.postcode, update.postcode);
        set(&mut self.latitude, update.latitude);
        set(&mut self.longitude, update.longitude);
        set(&mut self.uprn, update.uprn);
        set(&mut self.estab_uprn, update.estab_uprn);
        set(&mut self.organisation_name, update.organisation_name);
        set(&mut self.estab_type, update.estab_type);
        set(&mut self.address_type, update.address_type);
        set(&mut self.abp_code, update.abp_code);
        set(&mut self.oa, update.oa);
        set(&mut self.lsoa, update.lsoa);
        set(&mut self.msoa, update.msoa);
        set(&mut self.lad, update.lad);
    }

    /// Copy fields from `source` wherever this address has none.
    pub fn fill_from(&mut self, source: &Self) {
        fn fill(target: &mut Option<String>, value: &Option<String>) {
            if target.is_none() {
                target.clone_from(value);
            }
        }
        fill(&mut self.address_line1, &source.address_line1);
        fill(&mut self.address_line2, &source.address_line2);
        fill(&mut self.address_line3, &source.address_line3);
        fill(&mut self.town_name, &source.town_name);
        fill(&mut self.postcode, &source.postcode);
        fill(&mut self.latitude, &source.latitude);
        fill(&mut self.longitude, &source.longitude);
        fill(&mut self.uprn, &source.uprn);
        fill(&mut self.estab_uprn, &source.estab_uprn);
        fill(&mut self.organisation_name, &source.organisation_name);
        fill(&mut self.estab_type, &source.estab_type);
        fill(&mut self.address_type, &source.address_type);
        fill(&mut self.abp_code, &source.abp_code);
        fill(&mut self.oa, &source.oa);
        fill(&mut self.lsoa, &source.lsoa);
        fill(&mut self.msoa, &source.msoa);
        fill(&mut self.lad, &source.lad);
    }
}

/// A survey case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    /// Immutable case identifier
    pub case_id: Uuid,
    /// Externally visible case reference, assigned exactly once
    pub case_ref: i64,
    /// Case type
    pub case_type: CaseType,
    /// Address level
    pub address_level: AddressLevel,
    /// Region code; the first character is the country (E, W, N)
    pub region: String,
    /// Address and geography
    pub address: Address,
    /// Treatment code from the sample (e.g. `HH_LF3R2E`)
    pub treatment_code: Option<String>,
    /// Survey name (`CENSUS` or `CCS`)
    pub survey: String,
    /// Collection exercise
    pub collection_exercise_id: Option<Uuid>,
    /// Action plan
    pub action_plan_id: Option<Uuid>,
    /// Field coordinator
    pub field_coordinator_id: Option<String>,
    /// Field officer
    pub field_officer_id: Option<String>,
    /// Expected number of responses (CE only)
    pub ce_expected_capacity: Option<i32>,
    /// Number of individual responses received (CE only)
    pub ce_actual_responses: i32,
    /// True until mandatory fields have been supplied
    pub skeleton: bool,
    /// A valid receipt has been received
    pub receipt_received: bool,
    /// Most severe refusal recorded
    pub refusal_received: Option<RefusalType>,
    /// Address reported as not valid
    pub address_invalid: bool,
    /// Mail returned undelivered
    pub undelivered_as_addressed: bool,
    /// Questionnaires are hand delivered
    pub hand_delivery: bool,
    /// The online questionnaire has been launched
    pub survey_launched: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub last_updated_at: DateTime<Utc>,
}

impl Case {
    /// Create a new case with empty lifecycle flags.
    ///
    /// The case reference is assigned by the caller once a sequence number has
    /// been drawn; until then it is zero.
    #[must_use]
    pub fn new(
        case_id: Uuid,
        case_type: CaseType,
        address_level: AddressLevel,
        region: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            case_id,
            case_ref: 0,
            case_type,
            address_level,
            region: region.into(),
            address: Address::default(),
            treatment_code: None,
            survey: CENSUS_SURVEY.to_string(),
            collection_exercise_id: None,
            action_plan_id: None,
            field_coordinator_id: None,
            field_officer_id: None,
            ce_expected_capacity: None,
            ce_actual_responses: 0,
            skeleton: false,
            receipt_received: false,
            refusal_received: None,
            address_invalid: false,
            undelivered_as_addressed: false,
            hand_delivery: false,
            survey_launched: false,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Country code taken from the first character of the region.
    #[must_use]
    pub fn country_code(&self) -> Option<char> {
        self.region.chars().next()
    }

    /// True for Northern Ireland cases.
    #[must_use]
    pub fn is_northern_ireland(&self) -> bool {
        self.country_code() == Some('N')
    }

    /// True for communal establishment cases at unit level.
    #[must_use]
    pub fn is_ce_unit(&self) -> bool {
        self.case_type == CaseType::CommunalEstablishment
            && self.address_level == AddressLevel::Unit
    }

    /// True when a CE unit has fewer responses than its expected capacity.
    #[must_use]
    pub fn ce_below_capacity(&self) -> bool {
        self.ce_actual_responses < self.ce_expected_capacity.unwrap_or(0)
    }

    /// True when the case belongs to the Census Coverage Survey.
    #[must_use]
    pub fn is_ccs(&self) -> bool {
        self.survey == CCS_SURVEY
    }
}

/// A UAC/QID pair bound to a questionnaire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UacQidLink {
    /// Internal identifier
    pub id: Uuid,
    /// Questionnaire id (public, unique)
    pub qid: String,
    /// Unique access code (secret)
    pub uac: String,
    /// Linked case, if any
    pub case_id: Option<Uuid>,
    /// Usable for a response
    pub active: bool,
    /// A response has been receipted against this QID
    pub receipted: bool,
    /// A blank questionnaire was returned for this QID
    pub blank_questionnaire: bool,
    /// Issued for the Census Coverage Survey
    pub ccs_case: bool,
    /// Bulk issue batch
    pub batch_id: Option<Uuid>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub last_updated_at: DateTime<Utc>,
}

impl UacQidLink {
    /// Create a new active link.
    #[must_use]
    pub fn new(pair: UacQidPair, case_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            qid: pair.qid,
            uac: pair.uac,
            case_id,
            active: true,
            receipted: false,
            blank_questionnaire: false,
            ccs_case: false,
            batch_id: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Mark as receipted. A receipted link is never active again.
    pub fn receipt(&mut self, now: DateTime<Utc>) {
        self.receipted = true;
        self.active = false;
        self.last_updated_at = now;
    }

    /// Mark as a returned blank questionnaire.
    pub fn mark_blank(&mut self, now: DateTime<Utc>) {
        self.blank_questionnaire = true;
        self.active = false;
        self.last_updated_at = now;
    }

    /// True when this link represents a receipt that counts for its form.
    #[must_use]
    pub const fn is_valid_receipt(&self) -> bool {
        self.receipted && !self.blank_questionnaire
    }
}

/// A freshly generated UAC/QID pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UacQidPair {
    /// Unique access code
    pub uac: String,
    /// Questionnaire id
    pub qid: String,
}
