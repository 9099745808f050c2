//! Census Coverage Survey listing.

use super::{CaseProcessor, EventContext};
use census_rm_core::envelope::CcsProperty;
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{CCS_SURVEY, Case, CaseType, UacQidLink};
use census_rm_core::questionnaire::ccs_questionnaire_type;

/// `CCS_ADDRESS_LISTED`: an interviewer listed a property for the coverage
/// survey.
///
/// The case is created with any refusal or invalid address recorded at
/// listing. A questionnaire left at the property is linked to the case;
/// otherwise, when an interview is required, an interviewer questionnaire is
/// drawn from the cache.
pub(super) async fn ccs_address_listed(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    property: CcsProperty,
) -> Result<(), ProcessingError> {
    let case_id = property.collection_case.id;
    if ctx.find_case(case_id).await?.is_some() {
        tracing::debug!(case_id = %case_id, "CCS case already listed");
        return Ok(());
    }

    let unit = property.sample_unit;
    let case_type = unit
        .address
        .address_type
        .as_deref()
        .ok_or(ProcessingError::MissingMandatoryField("sampleUnit.addressType"))?
        .parse::<CaseType>()
        .map_err(|e| ProcessingError::Malformed(e.to_string()))?;

    let mut case = Case::new(case_id, case_type, unit.address_level, unit.region, ctx.now);
    case.survey = CCS_SURVEY.to_string();
    case.address = unit.address;
    case.field_coordinator_id = unit.field_coordinator_id;
    case.field_officer_id = unit.field_officer_id;
    case.refusal_received = property.refusal.map(|refusal| refusal.refusal_type);
    case.address_invalid = property.invalid_address.is_some();
    let case = engine.create_case(ctx, case).await?;

    if let Some(listed) = property.uac {
        let mut link = ctx.link(&listed.questionnaire_id).await?;
        link.case_id = Some(case.case_id);
        link.ccs_case = true;
        ctx.save_link(&mut link).await?;
        ctx.uac_updated(&link, Some(&case)).await?;
    } else if property.interview_required {
        let questionnaire_type = ccs_questionnaire_type(case.case_type, &case.region)?;
        let pair = engine.uac_cache.acquire(questionnaire_type).await?;
        let mut link = UacQidLink::new(pair, Some(case.case_id), ctx.now);
        link.ccs_case = true;
        ctx.save_link(&mut link).await?;
        ctx.uac_updated(&link, Some(&case)).await?;
    }

    ctx.audit("CCS address listed", Some(case.case_id), None)
        .await
}
