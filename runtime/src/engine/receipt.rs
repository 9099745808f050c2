//! Receipting.

use super::EventContext;
use census_rm_core::envelope::Response;
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{AddressLevel, Case, CaseType};
use census_rm_core::questionnaire::QuestionnaireType;

/// `RESPONSE_RECEIVED` for a completed questionnaire.
///
/// The link is receipted first. A QID that is already receipted changes no
/// case state, so redelivered receipts never count twice.
pub(super) async fn response_received(
    ctx: &mut EventContext<'_>,
    response: Response,
) -> Result<(), ProcessingError> {
    let mut link = ctx.link(&response.questionnaire_id).await?;
    let questionnaire_type = QuestionnaireType::from_qid(&link.qid)?;

    if link.receipted {
        tracing::debug!(qid = %link.qid, "QID already receipted, case left unchanged");
        return ctx
            .audit("Duplicate receipt received", link.case_id, Some(link.id))
            .await;
    }

    link.receipt(ctx.now);
    ctx.save_link(&mut link).await?;

    let case = match link.case_id {
        Some(case_id) => Some(receipt_case(ctx, case_id, questionnaire_type).await?),
        None => None,
    };
    ctx.uac_updated(&link, case.as_ref()).await?;

    ctx.audit("Receipt received", link.case_id, Some(link.id))
        .await
}

/// Apply a receipt of `questionnaire_type` to a case; returns the case as it
/// stands afterwards.
///
/// A case that is already receipted is left unchanged. Individual responses
/// for a CE are counted under a row lock so concurrent receipts never lose an
/// increment. A CE unit is receipted once the count reaches its expected
/// capacity; a CE establishment only counts.
pub(super) async fn receipt_case(
    ctx: &mut EventContext<'_>,
    case_id: uuid::Uuid,
    questionnaire_type: QuestionnaireType,
) -> Result<Case, ProcessingError> {
    if questionnaire_type.is_continuation() {
        tracing::debug!(case_id = %case_id, "Continuation questionnaire, no receipt");
        return ctx.case(case_id).await;
    }

    let case = ctx.case(case_id).await?;
    if case.receipt_received {
        tracing::debug!(case_id = %case_id, "Case already receipted");
        return Ok(case);
    }

    if case.case_type == CaseType::CommunalEstablishment && questionnaire_type.is_individual() {
        let mut locked = ctx.locked_case(case_id).await?;
        if locked.receipt_received {
            return Ok(locked);
        }
        locked.ce_actual_responses += 1;
        if locked.address_level == AddressLevel::Unit
            && locked.ce_actual_responses >= locked.ce_expected_capacity.unwrap_or(0)
        {
            locked.receipt_received = true;
        }
        ctx.save_case(&mut locked).await?;
        ctx.case_updated(&locked).await?;
        tracing::info!(
            case_id = %case_id,
            actual_responses = locked.ce_actual_responses,
            expected_capacity = ?locked.ce_expected_capacity,
            receipted = locked.receipt_received,
            "CE response counted"
        );
        return Ok(locked);
    }

    let mut case = case;
    case.receipt_received = true;
    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;
    tracing::info!(case_id = %case_id, "Case receipted");
    Ok(case)
}
