//! Sample loading.

use super::{CaseProcessor, EventContext};
use census_rm_core::envelope::SampleCase;
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{Case, UacQidLink};
use census_rm_core::questionnaire::questionnaire_types_for_treatment;

/// `SAMPLE_LOADED`: create a case and issue its questionnaires.
///
/// One pair is drawn per questionnaire type the treatment code calls for.
/// Redelivery of a case that was already loaded is ignored.
pub(super) async fn sample_loaded(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    sample: SampleCase,
) -> Result<(), ProcessingError> {
    if ctx.find_case(sample.case_id).await?.is_some() {
        tracing::debug!(case_id = %sample.case_id, "Sample case already loaded");
        return Ok(());
    }

    let questionnaire_types = questionnaire_types_for_treatment(&sample.treatment_code, sample.address_level)?;

    let mut case = Case::new(
        sample.case_id,
        sample.case_type,
        sample.address_level,
        sample.region,
        ctx.now,
    );
    case.address = sample.address;
    case.treatment_code = Some(sample.treatment_code);
    case.collection_exercise_id = sample.collection_exercise_id;
    case.action_plan_id = sample.action_plan_id;
    case.field_coordinator_id = sample.field_coordinator_id;
    case.field_officer_id = sample.field_officer_id;
    case.ce_expected_capacity = sample.ce_expected_capacity;
    case.hand_delivery = sample.hand_delivery;
    let case = engine.create_case(ctx, case).await?;

    for questionnaire_type in questionnaire_types {
        let pair = engine.uac_cache.acquire(questionnaire_type).await?;
        let mut link = UacQidLink::new(pair, Some(case.case_id), ctx.now);
        ctx.save_link(&mut link).await?;
        ctx.uac_updated(&link, Some(&case)).await?;
    }

    ctx.audit("Case created from sample", Some(case.case_id), None)
        .await
}
