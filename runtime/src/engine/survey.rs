//! Online survey events.

use super::EventContext;
use census_rm_core::envelope::Response;
use census_rm_core::error::ProcessingError;

/// `SURVEY_LAUNCHED`: the respondent opened the online questionnaire.
pub(super) async fn survey_launched(ctx: &mut EventContext<'_>, response: Response) -> Result<(), ProcessingError> {
    let link = ctx.link(&response.questionnaire_id).await?;
    if let Some(case_id) = link.case_id {
        let mut case = ctx.case(case_id).await?;
        case.survey_launched = true;
        ctx.save_case(&mut case).await?;
        ctx.case_updated(&case).await?;
    }

    ctx.audit("Survey launched", link.case_id, Some(link.id))
        .await
}

/// `RESPONDENT_AUTHENTICATED`: audit only.
pub(super) async fn respondent_authenticated(
    ctx: &mut EventContext<'_>,
    response: Response,
) -> Result<(), ProcessingError> {
    let link = ctx.link(&response.questionnaire_id).await?;
    ctx.audit("Respondent authenticated", link.case_id, Some(link.id))
        .await
}
