//! UAC/QID issue, ingestion and deactivation.

use super::{CaseProcessor, EventContext};
use census_rm_core::envelope::{UacCreated, UacReference, UnaddressedRequest};
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{UacQidLink, UacQidPair};

/// `UNADDRESSED_REQUESTED`: issue a pair that is not yet linked to any case.
pub(super) async fn unaddressed_requested(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    request: UnaddressedRequest,
) -> Result<(), ProcessingError> {
    let pair = engine.uac_cache.acquire(request.questionnaire_type).await?;
    let mut link = UacQidLink::new(pair, None, ctx.now);
    link.batch_id = request.batch_id;
    ctx.save_link(&mut link).await?;
    ctx.uac_updated(&link, None).await?;

    ctx.audit("Unaddressed UAC/QID pair issued", None, Some(link.id))
        .await
}

/// `RM_UAC_CREATED`: store a pair issued elsewhere in RM for a case.
///
/// Idempotent on the QID.
pub(super) async fn uac_created(ctx: &mut EventContext<'_>, created: UacCreated) -> Result<(), ProcessingError> {
    if let Some(existing) = ctx.tx.find_link_by_qid(&created.qid).await? {
        tracing::debug!(qid = %existing.qid, "UAC/QID pair already ingested");
        return Ok(());
    }

    let case = ctx.case(created.case_id).await?;
    let mut link = UacQidLink::new(
        UacQidPair {
            uac: created.uac,
            qid: created.qid,
        },
        Some(case.case_id),
        ctx.now,
    );
    link.batch_id = created.batch_id;
    link.ccs_case = case.is_ccs();
    ctx.save_link(&mut link).await?;
    ctx.uac_updated(&link, Some(&case)).await?;

    ctx.audit("RM UAC/QID pair created", Some(case.case_id), Some(link.id))
        .await
}

/// `DEACTIVATE_UAC`: the QID can no longer be used.
pub(super) async fn deactivate_uac(
    ctx: &mut EventContext<'_>,
    reference: UacReference,
) -> Result<(), ProcessingError> {
    let mut link = ctx.link(&reference.questionnaire_id).await?;
    link.active = false;
    ctx.save_link(&mut link).await?;

    let case = match link.case_id {
        Some(case_id) => ctx.find_case(case_id).await?,
        None => None,
    };
    ctx.uac_updated(&link, case.as_ref()).await?;

    ctx.audit("UAC/QID pair deactivated", link.case_id, Some(link.id))
        .await
}
