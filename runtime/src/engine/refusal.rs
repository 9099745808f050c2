//! Refusals.

use super::EventContext;
use census_rm_core::envelope::Refusal;
use census_rm_core::error::ProcessingError;

/// `REFUSAL_RECEIVED`: record the most severe refusal seen for the case.
///
/// A hard refusal never replaces an extraordinary one.
pub(super) async fn refusal_received(ctx: &mut EventContext<'_>, refusal: Refusal) -> Result<(), ProcessingError> {
    let mut case = ctx.case(refusal.collection_case.id).await?;
    case.refusal_received = case.refusal_received.max(Some(refusal.refusal_type));
    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;

    tracing::info!(
        case_id = %case.case_id,
        refusal_type = refusal.refusal_type.as_str(),
        recorded = ?case.refusal_received,
        "Refusal received"
    );
    ctx.audit(
        format!("Refusal received: {}", refusal.refusal_type.as_str()),
        Some(case.case_id),
        None,
    )
    .await
}
