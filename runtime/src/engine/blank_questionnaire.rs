//! Blank questionnaire handling.
//!
//! A questionnaire returned blank deactivates its link. What happens to the
//! case depends on the case type, address level, form type and whether the
//! case still holds another valid receipt for the same form. Every known
//! combination is listed in a static table; any other combination is a
//! configuration error and fails the message.

use super::EventContext;
use census_rm_core::envelope::Response;
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{AddressLevel, Case, CaseType, UacQidLink};
use census_rm_core::outbound::FieldAction;
use census_rm_core::questionnaire::{FormType, QuestionnaireType};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Lookup key for the blank questionnaire table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlankQuestionnaireKey {
    /// Case type
    pub case_type: CaseType,
    /// Address level
    pub address_level: AddressLevel,
    /// Form type of the returned questionnaire
    pub form_type: FormType,
    /// Another valid receipt exists for the same form type
    pub has_other_valid_receipt: bool,
}

/// What to do with the case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankQuestionnaireRule {
    /// Leave the case as it is
    NoActionRequired,
    /// Clear `receiptReceived`
    UnreceiptCase,
    /// Clear `receiptReceived` and ask field work to follow up
    UnreceiptCaseAndSendToField,
}

static RULES: LazyLock<HashMap<BlankQuestionnaireKey, BlankQuestionnaireRule>> = LazyLock::new(|| {
    use AddressLevel::{Establishment as E, Unit as U};
    use BlankQuestionnaireRule::{NoActionRequired, UnreceiptCase, UnreceiptCaseAndSendToField};
    use CaseType::{
        CommunalEstablishment as Ce, Household as Hh, HouseholdIndividual as Hi, SpecialPopulationGroup as Spg,
    };
    use FormType::{CommunalEstablishment as C, Household as H, Individual as I};

    let entries = [
        (Hh, U, H, false, UnreceiptCaseAndSendToField),
        (Hh, U, H, true, NoActionRequired),
        (Hh, U, I, false, NoActionRequired),
        (Hh, U, I, true, NoActionRequired),
        (Hi, U, I, false, UnreceiptCase),
        (Hi, U, I, true, NoActionRequired),
        (Ce, E, C, false, UnreceiptCaseAndSendToField),
        (Ce, E, C, true, NoActionRequired),
        (Ce, E, I, false, NoActionRequired),
        (Ce, E, I, true, NoActionRequired),
        (Ce, U, I, false, NoActionRequired),
        (Ce, U, I, true, NoActionRequired),
        (Spg, U, H, false, UnreceiptCaseAndSendToField),
        (Spg, U, H, true, NoActionRequired),
        (Spg, U, I, false, NoActionRequired),
        (Spg, U, I, true, NoActionRequired),
        (Spg, E, I, false, NoActionRequired),
        (Spg, E, I, true, NoActionRequired),
    ];

    entries
        .into_iter()
        .map(|(case_type, address_level, form_type, has_other_valid_receipt, rule)| {
            (
                BlankQuestionnaireKey {
                    case_type,
                    address_level,
                    form_type,
                    has_other_valid_receipt,
                },
                rule,
            )
        })
        .collect()
});

/// Look up the rule for a key.
///
/// # Errors
///
/// Returns [`ProcessingError::UnmappedBlankQuestionnaireRule`] if the table
/// has no entry for the key.
pub fn blank_questionnaire_rule(key: BlankQuestionnaireKey) -> Result<BlankQuestionnaireRule, ProcessingError> {
    RULES
        .get(&key)
        .copied()
        .ok_or(ProcessingError::UnmappedBlankQuestionnaireRule {
            case_type: key.case_type,
            address_level: key.address_level,
            form_type: key.form_type,
            has_other_valid_receipt: key.has_other_valid_receipt,
        })
}

/// `RESPONSE_RECEIVED` with `unreceipt = true`.
pub(super) async fn blank_questionnaire_received(
    ctx: &mut EventContext<'_>,
    response: Response,
) -> Result<(), ProcessingError> {
    let mut link = ctx.link(&response.questionnaire_id).await?;
    if link.blank_questionnaire {
        tracing::debug!(qid = %link.qid, "QID already blank, case left unchanged");
        return ctx
            .audit("Duplicate blank questionnaire received", link.case_id, Some(link.id))
            .await;
    }

    link.mark_blank(ctx.now);
    ctx.save_link(&mut link).await?;

    let case = match link.case_id {
        Some(case_id) => Some(apply_blank_questionnaire(ctx, case_id, &link).await?),
        None => None,
    };
    ctx.uac_updated(&link, case.as_ref()).await?;

    ctx.audit("Blank questionnaire received", link.case_id, Some(link.id))
        .await
}

/// Apply the table rule for a blank `link` to its case; returns the case as
/// it stands afterwards.
///
/// Continuation forms never affect the case.
pub(super) async fn apply_blank_questionnaire(
    ctx: &mut EventContext<'_>,
    case_id: uuid::Uuid,
    link: &UacQidLink,
) -> Result<Case, ProcessingError> {
    let mut case = ctx.case(case_id).await?;
    let form_type = QuestionnaireType::from_qid(&link.qid)?.form_type();
    if form_type == FormType::Continuation {
        return Ok(case);
    }

    let has_other_valid_receipt = ctx
        .tx
        .links_for_case(case_id)
        .await?
        .iter()
        .filter(|other| other.id != link.id && other.is_valid_receipt())
        .any(|other| {
            QuestionnaireType::from_qid(&other.qid).is_ok_and(|qt| qt.form_type() == form_type)
        });

    let rule = blank_questionnaire_rule(BlankQuestionnaireKey {
        case_type: case.case_type,
        address_level: case.address_level,
        form_type,
        has_other_valid_receipt,
    })?;
    tracing::debug!(case_id = %case_id, ?rule, "Blank questionnaire rule selected");

    match rule {
        BlankQuestionnaireRule::NoActionRequired => {},
        BlankQuestionnaireRule::UnreceiptCase => {
            case.receipt_received = false;
            ctx.save_case(&mut case).await?;
            ctx.case_updated(&case).await?;
        },
        BlankQuestionnaireRule::UnreceiptCaseAndSendToField => {
            case.receipt_received = false;
            ctx.save_case(&mut case).await?;
            ctx.case_updated(&case).await?;
            ctx.field_instruction_if_eligible(FieldAction::Create, &case)
                .await?;
        },
    }
    Ok(case)
}
