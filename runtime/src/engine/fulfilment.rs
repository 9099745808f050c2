//! Fulfilment requests and undelivered mail.

use super::{CaseProcessor, EventContext};
use census_rm_core::envelope::{FulfilmentRequest, UndeliveredMail};
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{CaseType, UacQidLink};
use census_rm_core::outbound::FieldAction;
use census_rm_core::questionnaire::is_individual_response_fulfilment;

/// `FULFILMENT_REQUESTED`.
///
/// An individual response requested for a household creates a household
/// individual case (idempotent on `individualCaseId`). A pair already issued
/// by RM for an SMS fulfilment is linked to the individual case when there is
/// one, else to the requesting case.
pub(super) async fn fulfilment_requested(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    request: FulfilmentRequest,
) -> Result<(), ProcessingError> {
    let parent = ctx.case(request.case_id).await?;

    let mut target = None;
    if is_individual_response_fulfilment(&request.fulfilment_code) && parent.case_type == CaseType::Household {
        let individual_case_id = request
            .individual_case_id
            .ok_or(ProcessingError::MissingMandatoryField("fulfilmentRequest.individualCaseId"))?;
        let individual = match ctx.find_case(individual_case_id).await? {
            Some(existing) => existing,
            None => {
                engine
                    .create_individual_case(ctx, &parent, individual_case_id)
                    .await?
            },
        };
        target = Some(individual);
    }
    let target = target.unwrap_or_else(|| parent.clone());

    if let Some(pair) = request.uac_qid_created {
        if ctx.tx.find_link_by_qid(&pair.qid).await?.is_some() {
            tracing::debug!(qid = %pair.qid, "Fulfilment UAC/QID pair already linked");
        } else {
            let mut link = UacQidLink::new(pair, Some(target.case_id), ctx.now);
            link.ccs_case = target.is_ccs();
            ctx.save_link(&mut link).await?;
            ctx.uac_updated(&link, Some(&target)).await?;
        }
    }

    ctx.audit(
        format!("Fulfilment requested: {}", request.fulfilment_code),
        Some(parent.case_id),
        None,
    )
    .await
}

/// `UNDELIVERED_MAIL_REPORTED`: mail to the case was returned.
///
/// The case is found through the QID when one is given, else through the case
/// reference.
pub(super) async fn undelivered_mail_reported(
    ctx: &mut EventContext<'_>,
    report: UndeliveredMail,
) -> Result<(), ProcessingError> {
    let (case, link_id) = if let Some(qid) = report.questionnaire_id.as_deref() {
        let link = ctx.link(qid).await?;
        let case = match link.case_id {
            Some(case_id) => Some(ctx.case(case_id).await?),
            None => None,
        };
        (case, Some(link.id))
    } else if let Some(case_ref) = report.case_ref.as_deref() {
        let parsed: i64 = case_ref
            .trim()
            .parse()
            .map_err(|_| ProcessingError::CaseNotFound(format!("case ref {case_ref}")))?;
        let case = ctx
            .tx
            .find_case_by_ref(parsed)
            .await?
            .ok_or_else(|| ProcessingError::CaseNotFound(format!("case ref {case_ref}")))?;
        (Some(case), None)
    } else {
        return Err(ProcessingError::MissingMandatoryField(
            "fulfilmentInformation.caseRef or questionnaireId",
        ));
    };

    let case_id = match case {
        Some(mut case) => {
            case.undelivered_as_addressed = true;
            ctx.save_case(&mut case).await?;
            ctx.case_updated(&case).await?;
            ctx.field_instruction_if_eligible(FieldAction::Update, &case)
                .await?;
            Some(case.case_id)
        },
        None => None,
    };

    ctx.audit("Undelivered mail reported", case_id, link_id)
        .await
}
