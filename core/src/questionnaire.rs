//! Questionnaire types, form types and treatment code mapping.
//!
//! The first two digits of a QID are its questionnaire type: the first digit
//! selects the form and the second the country variant (1 England, 2 Wales in
//! English, 3 Wales in Welsh, 4 Northern Ireland).

use crate::model::{AddressLevel, CaseType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from questionnaire type handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuestionnaireError {
    /// QID prefix is not a known questionnaire type.
    #[error("Invalid questionnaire type in QID '{0}'")]
    InvalidQid(String),

    /// Questionnaire type code is not known.
    #[error("Invalid questionnaire type: {0}")]
    InvalidType(u8),

    /// Treatment code does not map to any questionnaire type.
    #[error("Unexpected treatment code: {0}")]
    InvalidTreatmentCode(String),
}

/// Paper or online form family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormType {
    /// Household form
    #[serde(rename = "H")]
    Household,
    /// Individual form
    #[serde(rename = "I")]
    Individual,
    /// Communal establishment form
    #[serde(rename = "C")]
    CommunalEstablishment,
    /// Household continuation form
    #[serde(rename = "CONT")]
    Continuation,
}

impl FormType {
    /// Wire code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Household => "H",
            Self::Individual => "I",
            Self::CommunalEstablishment => "C",
            Self::Continuation => "CONT",
        }
    }
}

/// Two-digit questionnaire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct QuestionnaireType(u8);

impl QuestionnaireType {
    /// Household, England.
    pub const HOUSEHOLD_ENGLAND: Self = Self(1);
    /// Household, Wales (English).
    pub const HOUSEHOLD_WALES: Self = Self(2);
    /// Household, Wales (Welsh).
    pub const HOUSEHOLD_WALES_WELSH: Self = Self(3);
    /// Household, Northern Ireland.
    pub const HOUSEHOLD_NI: Self = Self(4);
    /// Individual, England.
    pub const INDIVIDUAL_ENGLAND: Self = Self(21);
    /// Individual, Wales (English).
    pub const INDIVIDUAL_WALES: Self = Self(22);
    /// Individual, Wales (Welsh).
    pub const INDIVIDUAL_WALES_WELSH: Self = Self(23);
    /// Individual, Northern Ireland.
    pub const INDIVIDUAL_NI: Self = Self(24);
    /// Communal establishment, England.
    pub const CE_ENGLAND: Self = Self(31);
    /// Communal establishment, Wales (English).
    pub const CE_WALES: Self = Self(32);
    /// Communal establishment, Wales (Welsh).
    pub const CE_WALES_WELSH: Self = Self(33);
    /// Communal establishment, Northern Ireland.
    pub const CE_NI: Self = Self(34);

    /// Create from a two-digit code.
    ///
    /// # Errors
    ///
    /// Returns [`QuestionnaireError::InvalidType`] for unknown codes.
    pub fn new(code: u8) -> Result<Self, QuestionnaireError> {
        let form_digit = code / 10;
        let country_digit = code % 10;
        let known_form = matches!(form_digit, 0 | 1 | 2 | 3 | 7 | 8);
        if known_form && (1..=4).contains(&country_digit) {
            Ok(Self(code))
        } else {
            Err(QuestionnaireError::InvalidType(code))
        }
    }

    /// Parse the questionnaire type from the first two digits of a QID.
    ///
    /// # Errors
    ///
    /// Returns [`QuestionnaireError::InvalidQid`] if the prefix is not numeric
    /// or not a known type.
    pub fn from_qid(qid: &str) -> Result<Self, QuestionnaireError> {
        qid.get(0..2)
            .and_then(|prefix| prefix.parse::<u8>().ok())
            .and_then(|code| Self::new(code).ok())
            .ok_or_else(|| QuestionnaireError::InvalidQid(qid.to_string()))
    }

    /// The numeric code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Form family of this questionnaire type.
    #[must_use]
    pub const fn form_type(self) -> FormType {
        match self.0 / 10 {
            1 => FormType::Continuation,
            2 => FormType::Individual,
            3 | 8 => FormType::CommunalEstablishment,
            _ => FormType::Household,
        }
    }

    /// True for Census Coverage Survey interviewer questionnaires.
    #[must_use]
    pub const fn is_ccs(self) -> bool {
        matches!(self.0 / 10, 7 | 8)
    }

    /// True for individual response questionnaires.
    #[must_use]
    pub const fn is_individual(self) -> bool {
        matches!(self.form_type(), FormType::Individual)
    }

    /// True for household continuation questionnaires.
    #[must_use]
    pub const fn is_continuation(self) -> bool {
        matches!(self.form_type(), FormType::Continuation)
    }
}

impl TryFrom<u8> for QuestionnaireType {
    type Error = QuestionnaireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QuestionnaireType> for u8 {
    fn from(value: QuestionnaireType) -> Self {
        value.0
    }
}

impl fmt::Display for QuestionnaireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Country variants a case receives questionnaires for.
fn country_variants(country: char) -> Option<&'static [u8]> {
    match country {
        'E' => Some(&[1]),
        'W' => Some(&[2, 3]),
        'N' => Some(&[4]),
        _ => None,
    }
}

fn with_form(form_digit: u8, country: char) -> Option<Vec<QuestionnaireType>> {
    country_variants(country).map(|variants| {
        variants
            .iter()
            .map(|v| QuestionnaireType(form_digit * 10 + v))
            .collect()
    })
}

/// Questionnaire types issued to a sampled case for its treatment code.
///
/// Household and SPG treatments receive household forms; CE establishments
/// receive CE forms and CE units receive individual forms. Welsh treatments
/// receive both the English and the Welsh variant.
///
/// # Errors
///
/// Returns [`QuestionnaireError::InvalidTreatmentCode`] if the code does not
/// follow the `<TYPE>_<...><COUNTRY>` convention.
pub fn questionnaire_types_for_treatment(
    treatment_code: &str,
    address_level: AddressLevel,
) -> Result<Vec<QuestionnaireType>, QuestionnaireError> {
    let invalid = || QuestionnaireError::InvalidTreatmentCode(treatment_code.to_string());
    let country = treatment_code.chars().last().ok_or_else(invalid)?;

    let form_digit = if treatment_code.starts_with("HH_") || treatment_code.starts_with("SPG_") {
        0
    } else if treatment_code.starts_with("CE_") {
        match address_level {
            AddressLevel::Establishment => 3,
            AddressLevel::Unit => 2,
        }
    } else {
        return Err(invalid());
    };

    with_form(form_digit, country).ok_or_else(invalid)
}

/// CCS interviewer questionnaire type for a listed case.
///
/// # Errors
///
/// Returns [`QuestionnaireError::InvalidTreatmentCode`] when the region does
/// not carry a known country code.
pub fn ccs_questionnaire_type(
    case_type: CaseType,
    region: &str,
) -> Result<QuestionnaireType, QuestionnaireError> {
    let form_digit = match case_type {
        CaseType::CommunalEstablishment => 8,
        CaseType::Household | CaseType::HouseholdIndividual | CaseType::SpecialPopulationGroup => 7,
    };
    let country_digit = match region.chars().next() {
        Some('E') => 1,
        Some('W') => 2,
        Some('N') => 4,
        _ => return Err(QuestionnaireError::InvalidTreatmentCode(region.to_string())),
    };
    Ok(QuestionnaireType(form_digit * 10 + country_digit))
}

/// Fulfilment codes requesting an individual response for a household member.
pub const INDIVIDUAL_RESPONSE_FULFILMENT_CODES: [&str; 8] = [
    "P_OR_I1", "P_OR_I2", "P_OR_I2W", "P_OR_I4", "UACIT1", "UACIT2", "UACIT2W", "UACIT4",
];

/// True if the fulfilment code requests an individual response.
#[must_use]
pub fn is_individual_response_fulfilment(fulfilment_code: &str) -> bool {
    INDIVIDUAL_RESPONSE_FULFILMENT_CODES.contains(&fulfilment_code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn form_type_from_qid() {
        let cases = [
            ("0112345678901234", FormType::Household),
            ("1112345678901234", FormType::Continuation),
            ("2112345678901234", FormType::Individual),
            ("3112345678901234", FormType::CommunalEstablishment),
            ("7112345678901234", FormType::Household),
        ];
        for (qid, form) in cases {
            assert_eq!(QuestionnaireType::from_qid(qid).unwrap().form_type(), form, "{qid}");
        }
    }

    #[test]
    fn rejects_unknown_prefixes() {
        assert!(QuestionnaireType::from_qid("9912345678").is_err());
        assert!(QuestionnaireType::from_qid("x1").is_err());
        assert!(QuestionnaireType::from_qid("").is_err());
        assert!(QuestionnaireType::from_qid("05123").is_err());
    }

    #[test]
    fn welsh_households_get_two_questionnaires() {
        let types =
            questionnaire_types_for_treatment("HH_LF3R2W", AddressLevel::Unit).unwrap();
        assert_eq!(
            types,
            vec![
                QuestionnaireType::HOUSEHOLD_WALES,
                QuestionnaireType::HOUSEHOLD_WALES_WELSH
            ]
        );
    }

    #[test]
    fn ce_units_get_individual_questionnaires() {
        let unit = questionnaire_types_for_treatment("CE_LDIEE", AddressLevel::Unit).unwrap();
        assert_eq!(unit, vec![QuestionnaireType::INDIVIDUAL_ENGLAND]);

        let estab =
            questionnaire_types_for_treatment("CE_LDIEE", AddressLevel::Establishment).unwrap();
        assert_eq!(estab, vec![QuestionnaireType::CE_ENGLAND]);
    }

    #[test]
    fn unknown_treatment_codes_are_rejected() {
        assert!(questionnaire_types_for_treatment("XX_1E", AddressLevel::Unit).is_err());
        assert!(questionnaire_types_for_treatment("HH_LF3R2Z", AddressLevel::Unit).is_err());
    }

    #[test]
    fn ccs_questionnaires_follow_case_type() {
        assert_eq!(
            ccs_questionnaire_type(CaseType::Household, "E1000").unwrap().code(),
            71
        );
        assert_eq!(
            ccs_questionnaire_type(CaseType::CommunalEstablishment, "N0000")
                .unwrap()
                .code(),
            84
        );
    }

    #[test]
    fn displays_with_leading_zero() {
        assert_eq!(QuestionnaireType::HOUSEHOLD_ENGLAND.to_string(), "01");
    }
}
