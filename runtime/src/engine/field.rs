//! Field work eligibility and field case updates.

use super::EventContext;
use census_rm_core::envelope::{FIELD_CHANNEL, FieldCaseUpdate};
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{Case, CaseType, TRANSIENT_ESTAB_TYPES};
use census_rm_core::outbound::FieldAction;

/// Whether a field work instruction should be sent for `case`.
///
/// Events that arrived on the field channel never loop back to field work.
/// A CE unit that has been receipted stays eligible while it is below its
/// expected capacity.
#[must_use]
pub fn is_eligible_for_field(case: &Case, channel: &str) -> bool {
    if channel == FIELD_CHANNEL {
        return false;
    }
    if case.case_type == CaseType::CommunalEstablishment && case.is_northern_ireland() {
        return false;
    }
    if case.refusal_received.is_some() || case.address_invalid {
        return false;
    }
    if case.receipt_received && !(case.is_ce_unit() && case.ce_below_capacity()) {
        return false;
    }
    if case
        .address
        .estab_type
        .as_deref()
        .is_some_and(|estab_type| TRANSIENT_ESTAB_TYPES.contains(&estab_type))
    {
        return false;
    }

    let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
    present(&case.field_coordinator_id)
        && present(&case.field_officer_id)
        && present(&case.address.latitude)
        && present(&case.address.longitude)
        && (case.case_type != CaseType::CommunalEstablishment || present(&case.address.estab_uprn))
}

/// `FIELD_CASE_UPDATED`: field work reports a new expected capacity for a CE.
///
/// The case is locked like a CE receipt, so a response counted concurrently
/// is never overwritten.
pub(super) async fn field_case_updated(
    ctx: &mut EventContext<'_>,
    update: FieldCaseUpdate,
) -> Result<(), ProcessingError> {
    let mut case = ctx.locked_case(update.id).await?;
    if case.case_type != CaseType::CommunalEstablishment {
        return Err(ProcessingError::UnsupportedCaseType {
            case_id: case.case_id,
            case_type: case.case_type,
            event_type: ctx.header.event_type,
        });
    }
    let capacity = update
        .ce_expected_capacity
        .ok_or(ProcessingError::MissingMandatoryField("ceExpectedCapacity"))?;

    case.ce_expected_capacity = Some(capacity);
    if case.is_ce_unit() {
        case.receipt_received = case.ce_actual_responses >= capacity;
    }
    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;
    ctx.field_instruction_if_eligible(FieldAction::Update, &case)
        .await?;

    ctx.audit(
        format!("Field case updated, expected capacity {capacity}"),
        Some(case.case_id),
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use census_rm_core::model::{AddressLevel, RefusalType};
    use chrono::Utc;
    use uuid::Uuid;

    fn eligible_case(case_type: CaseType, level: AddressLevel) -> Case {
        let mut case = Case::new(Uuid::new_v4(), case_type, level, "E12000009", Utc::now());
        case.field_coordinator_id = Some("FC1".into());
        case.field_officer_id = Some("FO1".into());
        case.address.latitude = Some("50.7".into());
        case.address.longitude = Some("-3.5".into());
        case.address.estab_uprn = Some("10008677190".into());
        case
    }

    #[test]
    fn complete_household_is_eligible() {
        let case = eligible_case(CaseType::Household, AddressLevel::Unit);
        assert!(is_eligible_for_field(&case, "CC"));
    }

    #[test]
    fn field_channel_is_excluded() {
        let case = eligible_case(CaseType::Household, AddressLevel::Unit);
        assert!(!is_eligible_for_field(&case, FIELD_CHANNEL));
    }

    #[test]
    fn northern_ireland_ce_is_excluded() {
        let mut case = eligible_case(CaseType::CommunalEstablishment, AddressLevel::Establishment);
        case.region = "N92000002".into();
        assert!(!is_eligible_for_field(&case, "RM"));

        let mut household = eligible_case(CaseType::Household, AddressLevel::Unit);
        household.region = "N92000002".into();
        assert!(is_eligible_for_field(&household, "RM"));
    }

    #[test]
    fn refused_invalid_and_receipted_are_excluded() {
        let mut refused = eligible_case(CaseType::Household, AddressLevel::Unit);
        refused.refusal_received = Some(RefusalType::HardRefusal);
        assert!(!is_eligible_for_field(&refused, "RM"));

        let mut invalid = eligible_case(CaseType::Household, AddressLevel::Unit);
        invalid.address_invalid = true;
        assert!(!is_eligible_for_field(&invalid, "RM"));

        let mut receipted = eligible_case(CaseType::Household, AddressLevel::Unit);
        receipted.receipt_received = true;
        assert!(!is_eligible_for_field(&receipted, "RM"));
    }

    #[test]
    fn receipted_ce_unit_below_capacity_stays_eligible() {
        let mut case = eligible_case(CaseType::CommunalEstablishment, AddressLevel::Unit);
        case.receipt_received = true;
        case.ce_expected_capacity = Some(5);
        case.ce_actual_responses = 3;
        assert!(is_eligible_for_field(&case, "RM"));

        case.ce_actual_responses = 5;
        assert!(!is_eligible_for_field(&case, "RM"));
    }

    #[test]
    fn transient_establishments_are_excluded() {
        for estab_type in TRANSIENT_ESTAB_TYPES {
            let mut case = eligible_case(CaseType::CommunalEstablishment, AddressLevel::Establishment);
            case.address.estab_type = Some(estab_type.to_string());
            assert!(!is_eligible_for_field(&case, "RM"), "{estab_type}");
        }
    }

    #[test]
    fn missing_field_data_is_excluded() {
        let mut no_officer = eligible_case(CaseType::Household, AddressLevel::Unit);
        no_officer.field_officer_id = Some("  ".into());
        assert!(!is_eligible_for_field(&no_officer, "RM"));

        let mut no_geocode = eligible_case(CaseType::Household, AddressLevel::Unit);
        no_geocode.address.latitude = None;
        assert!(!is_eligible_for_field(&no_geocode, "RM"));

        let mut ce_without_estab = eligible_case(CaseType::CommunalEstablishment, AddressLevel::Establishment);
        ce_without_estab.address.estab_uprn = None;
        assert!(!is_eligible_for_field(&ce_without_estab, "RM"));

        let mut household_without_estab = eligible_case(CaseType::Household, AddressLevel::Unit);
        household_without_estab.address.estab_uprn = None;
        assert!(is_eligible_for_field(&household_without_estab, "RM"));
    }
}
