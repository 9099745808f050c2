//! Questionnaire linking.

use super::{CaseProcessor, EventContext, blank_questionnaire, receipt};
use census_rm_core::envelope::{EventType, UacReference};
use census_rm_core::error::ProcessingError;
use census_rm_core::model::CaseType;
use census_rm_core::questionnaire::QuestionnaireType;
use uuid::Uuid;

/// `QUESTIONNAIRE_LINKED`: attach a QID to a case.
///
/// - Moving a QID off another case leaves a `QUESTIONNAIRE_UNLINKED` audit
///   record on that case.
/// - An individual questionnaire linked to a household is attached to a
///   household individual case, created from the household when it does not
///   exist yet.
/// - A link that was already used is replayed against its new case: a blank
///   questionnaire through the blank questionnaire rule, a receipt through the
///   receipting rule. An active link only moves.
pub(super) async fn questionnaire_linked(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    reference: UacReference,
) -> Result<(), ProcessingError> {
    let case_id = reference
        .case_id
        .ok_or(ProcessingError::MissingMandatoryField("uac.caseId"))?;
    let mut link = ctx.link(&reference.questionnaire_id).await?;
    let questionnaire_type = QuestionnaireType::from_qid(&link.qid)?;

    let mut case = ctx.case(case_id).await?;
    if case.case_type == CaseType::Household && questionnaire_type.is_individual() {
        let individual_case_id = reference.individual_case_id.unwrap_or_else(Uuid::new_v4);
        case = match ctx.find_case(individual_case_id).await? {
            Some(existing) => existing,
            None => {
                engine
                    .create_individual_case(ctx, &case, individual_case_id)
                    .await?
            },
        };
    }

    if let Some(previous_case_id) = link.case_id.filter(|id| *id != case.case_id) {
        ctx.audit_as(
            EventType::QuestionnaireUnlinked,
            format!("Questionnaire unlinked from case {previous_case_id}"),
            Some(previous_case_id),
            Some(link.id),
        )
        .await?;
        tracing::info!(
            qid = %link.qid,
            previous_case_id = %previous_case_id,
            case_id = %case.case_id,
            "Questionnaire moved to another case"
        );
    }

    link.case_id = Some(case.case_id);
    link.ccs_case = case.is_ccs();
    ctx.save_link(&mut link).await?;

    if !link.active {
        case = if link.blank_questionnaire {
            blank_questionnaire::apply_blank_questionnaire(ctx, case.case_id, &link).await?
        } else if link.receipted {
            receipt::receipt_case(ctx, case.case_id, questionnaire_type).await?
        } else {
            case
        };
    }

    ctx.uac_updated(&link, Some(&case)).await?;

    ctx.audit("Questionnaire linked", Some(case.case_id), Some(link.id))
        .await
}
