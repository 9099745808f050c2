//! Address events.

use super::{CaseProcessor, EventContext};
use census_rm_core::collaborators::NewAddressEnhanced;
use census_rm_core::envelope::{
    AddressModification, AddressTypeChange, InvalidAddress, NewAddress, UninvalidateAddress,
};
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{AddressLevel, CENSUS_SURVEY, Case, CaseType};
use census_rm_core::outbound::FieldAction;

/// Prefix of the UPRN given to reported addresses that have none.
pub const DUMMY_UPRN_PREFIX: &str = "999";

/// Address level of a case retyped from `from` to `to`, or `None` when the
/// transition is not allowed.
#[must_use]
pub const fn retyped_address_level(from: CaseType, to: CaseType) -> Option<AddressLevel> {
    use CaseType::{CommunalEstablishment as Ce, Household as Hh, SpecialPopulationGroup as Spg};
    match (from, to) {
        (Hh | Spg, Ce) => Some(AddressLevel::Establishment),
        (Hh | Ce, Spg) | (Spg | Ce, Hh) => Some(AddressLevel::Unit),
        _ => None,
    }
}

/// `ADDRESS_MODIFIED`: partial update of the address.
///
/// Absent fields are left alone and `null` clears a field, except for the
/// first address line, town and postcode which can never be cleared.
pub(super) async fn address_modified(
    ctx: &mut EventContext<'_>,
    modification: AddressModification,
) -> Result<(), ProcessingError> {
    let update = modification.new_address;
    for (name, patch) in [
        ("newAddress.addressLine1", &update.address_line1),
        ("newAddress.townName", &update.town_name),
        ("newAddress.postcode", &update.postcode),
    ] {
        if patch.is_null() {
            return Err(ProcessingError::MissingMandatoryField(name));
        }
    }

    let mut case = ctx.case(modification.collection_case.id).await?;
    let address = &mut case.address;
    let changed = [
        update.address_line1.apply_to(&mut address.address_line1),
        update.address_line2.apply_to(&mut address.address_line2),
        update.address_line3.apply_to(&mut address.address_line3),
        update.town_name.apply_to(&mut address.town_name),
        update.postcode.apply_to(&mut address.postcode),
        update.organisation_name.apply_to(&mut address.organisation_name),
        update.estab_type.apply_to(&mut address.estab_type),
    ]
    .into_iter()
    .filter(|written| *written)
    .count();

    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;
    tracing::debug!(case_id = %case.case_id, changed, "Address modified");

    ctx.audit("Address modified", Some(case.case_id), None)
        .await
}

/// `ADDRESS_NOT_VALID`.
pub(super) async fn address_not_valid(
    ctx: &mut EventContext<'_>,
    invalid: InvalidAddress,
) -> Result<(), ProcessingError> {
    let case = ctx.case(invalid.collection_case.id).await?;
    let case = invalidate(ctx, case).await?;

    ctx.audit(
        format!("Invalid address: {}", invalid.reason),
        Some(case.case_id),
        None,
    )
    .await
}

/// Mark a case's address invalid and cancel field work unless field work
/// reported it.
async fn invalidate(ctx: &mut EventContext<'_>, mut case: Case) -> Result<Case, ProcessingError> {
    case.address_invalid = true;
    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;
    if !ctx.header.is_field_channel() {
        ctx.field_instruction(FieldAction::Cancel, &case).await?;
    }
    tracing::info!(case_id = %case.case_id, "Address invalidated");
    Ok(case)
}

/// `RM_UNINVALIDATE_ADDRESS`.
pub(super) async fn uninvalidate_address(
    ctx: &mut EventContext<'_>,
    request: UninvalidateAddress,
) -> Result<(), ProcessingError> {
    let mut case = ctx.case(request.case_id).await?;
    case.address_invalid = false;
    ctx.save_case(&mut case).await?;
    ctx.case_updated(&case).await?;

    ctx.audit("Address un-invalidated", Some(case.case_id), None)
        .await
}

/// `ADDRESS_TYPE_CHANGED`: replace a case with a skeleton case of another
/// type at the same address.
///
/// The old case is invalidated. The new case inherits address, region,
/// geography and field ids, with its address level taken from the transition
/// table.
pub(super) async fn address_type_changed(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    change: AddressTypeChange,
) -> Result<(), ProcessingError> {
    let retyped = change.collection_case;
    if change.new_case_id == retyped.id {
        return Err(ProcessingError::InvalidCaseTypeChange {
            case_id: retyped.id,
            reason: "new case id must differ from the old case id".to_string(),
        });
    }

    let old = ctx.case(retyped.id).await?;
    if old.case_type == CaseType::HouseholdIndividual {
        return Err(ProcessingError::InvalidCaseTypeChange {
            case_id: old.case_id,
            reason: "household individual cases cannot be retyped".to_string(),
        });
    }

    let requested = retyped
        .address
        .address_type
        .clone()
        .ok_or(ProcessingError::MissingMandatoryField("collectionCase.address.addressType"))?;
    let invalid_change = || ProcessingError::InvalidAddressTypeChange {
        from: old.case_type,
        to: requested.clone(),
    };
    let new_type: CaseType = requested.parse().map_err(|_| invalid_change())?;
    let address_level = retyped_address_level(old.case_type, new_type).ok_or_else(invalid_change)?;

    let mut new_case = Case::new(change.new_case_id, new_type, address_level, old.region.clone(), ctx.now);
    new_case.skeleton = true;
    new_case.address = old.address.clone();
    new_case.address.overlay(retyped.address);
    new_case.survey.clone_from(&old.survey);
    new_case.collection_exercise_id = old.collection_exercise_id;
    new_case.action_plan_id = old.action_plan_id;
    new_case.field_coordinator_id.clone_from(&old.field_coordinator_id);
    new_case.field_officer_id.clone_from(&old.field_officer_id);
    new_case.ce_expected_capacity = retyped.ce_expected_capacity;

    let old = invalidate(ctx, old).await?;
    let new_case = engine.create_case(ctx, new_case).await?;
    tracing::info!(
        old_case_id = %old.case_id,
        new_case_id = %new_case.case_id,
        from = %old.case_type,
        to = %new_case.case_type,
        "Address type changed"
    );

    ctx.audit(
        format!("Address type changed from {} to {}", old.case_type, new_case.case_type),
        Some(old.case_id),
        None,
    )
    .await
}

/// `NEW_ADDRESS_REPORTED`: an address that was not in the sample.
///
/// Id, address type, address level and region are mandatory. Fields missing
/// from the report are copied from `sourceCaseId` when given. An address
/// without a UPRN gets a dummy one built from the case reference and is sent
/// to the address index.
pub(super) async fn new_address_reported(
    engine: &CaseProcessor,
    ctx: &mut EventContext<'_>,
    report: NewAddress,
) -> Result<(), ProcessingError> {
    let reported = report.collection_case;
    let case_id = reported
        .id
        .ok_or(ProcessingError::MissingMandatoryField("collectionCase.id"))?;
    let address_type = reported
        .address
        .address
        .address_type
        .clone()
        .ok_or(ProcessingError::MissingMandatoryField("collectionCase.address.addressType"))?;
    let address_level = reported
        .address
        .address_level
        .ok_or(ProcessingError::MissingMandatoryField("collectionCase.address.addressLevel"))?;
    let region = reported
        .address
        .region
        .clone()
        .filter(|region| !region.trim().is_empty())
        .ok_or(ProcessingError::MissingMandatoryField("collectionCase.address.region"))?;
    let case_type = match reported.case_type {
        Some(case_type) => case_type,
        None => address_type
            .parse::<CaseType>()
            .map_err(|e| ProcessingError::Malformed(e.to_string()))?,
    };

    if ctx.find_case(case_id).await?.is_some() {
        tracing::debug!(case_id = %case_id, "New address case already exists");
        return Ok(());
    }

    let mut case = Case::new(case_id, case_type, address_level, region, ctx.now);
    case.skeleton = true;
    case.address = reported.address.address;
    case.survey = reported.survey.unwrap_or_else(|| CENSUS_SURVEY.to_string());
    case.collection_exercise_id = reported.collection_exercise_id;
    case.field_coordinator_id = reported.field_coordinator_id;
    case.field_officer_id = reported.field_officer_id;
    case.ce_expected_capacity = reported.ce_expected_capacity;

    if let Some(source_case_id) = report.source_case_id {
        let source = ctx.case(source_case_id).await?;
        case.address.fill_from(&source.address);
        case.collection_exercise_id = case.collection_exercise_id.or(source.collection_exercise_id);
        case.action_plan_id = case.action_plan_id.or(source.action_plan_id);
        case.treatment_code = case.treatment_code.or(source.treatment_code);
        case.field_coordinator_id = case.field_coordinator_id.or(source.field_coordinator_id);
        case.field_officer_id = case.field_officer_id.or(source.field_officer_id);
    }

    engine.assign_case_ref(ctx, &mut case).await?;
    let needs_uprn = case.address.uprn.as_deref().is_none_or(|uprn| uprn.trim().is_empty());
    if needs_uprn {
        case.address.uprn = Some(format!("{DUMMY_UPRN_PREFIX}{}", case.case_ref));
    }
    let case = engine.create_case(ctx, case).await?;

    if needs_uprn {
        engine.forward_new_address(
            ctx,
            NewAddressEnhanced {
                case_id: case.case_id,
                case_ref: case.case_ref,
                case_type: case.case_type,
                address_level: case.address_level,
                region: case.region.clone(),
                address: case.address.clone(),
            },
        );
    }

    ctx.audit("New address reported", Some(case.case_id), None)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retyping_table() {
        use CaseType::{
            CommunalEstablishment as Ce, Household as Hh, HouseholdIndividual as Hi,
            SpecialPopulationGroup as Spg,
        };
        assert_eq!(retyped_address_level(Hh, Ce), Some(AddressLevel::Establishment));
        assert_eq!(retyped_address_level(Spg, Ce), Some(AddressLevel::Establishment));
        assert_eq!(retyped_address_level(Hh, Spg), Some(AddressLevel::Unit));
        assert_eq!(retyped_address_level(Ce, Spg), Some(AddressLevel::Unit));
        assert_eq!(retyped_address_level(Spg, Hh), Some(AddressLevel::Unit));
        assert_eq!(retyped_address_level(Ce, Hh), Some(AddressLevel::Unit));

        for same in [Hh, Ce, Spg, Hi] {
            assert_eq!(retyped_address_level(same, same), None);
        }
        assert_eq!(retyped_address_level(Hh, Hi), None);
        assert_eq!(retyped_address_level(Hi, Hh), None);
    }
}
