//! Address modifications, invalidation, retyping and new addresses.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

mod common;

use census_rm_core::envelope::EventType;
use census_rm_core::error::ProcessingError;
use census_rm_core::model::{AddressLevel, CaseType};
use census_rm_core::outbound::OutboundEventType;
use census_rm_runtime::engine::DUMMY_UPRN_PREFIX;
use census_rm_testing::fixtures::{self, envelope, envelope_from};
use census_rm_testing::helpers::eventually;
use common::Harness;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn keys(harness: &Harness, event_type: OutboundEventType) -> Vec<String> {
    harness
        .store
        .outbound_of(event_type)
        .into_iter()
        .map(|message| message.key)
        .collect()
}

#[tokio::test]
async fn household_retyped_to_ce_invalidates_old_case_and_creates_new_one() {
    let harness = Harness::new();
    let old = fixtures::household_case("E12000001");
    harness.store.insert_case(old.clone());
    let new_case_id = Uuid::new_v4();

    let body = envelope(
        EventType::AddressTypeChanged,
        json!({"addressTypeChange": {
            "newCaseId": new_case_id,
            "collectionCase": {
                "id": old.case_id,
                "ceExpectedCapacity": 20,
                "address": {"addressType": "CE", "estabType": "CARE HOME"},
            },
        }}),
    );
    harness.apply(EventType::AddressTypeChanged, &body).await.unwrap();

    assert!(harness.store.case(old.case_id).unwrap().address_invalid);
    let new_case = harness.store.case(new_case_id).unwrap();
    assert_eq!(new_case.case_type, CaseType::CommunalEstablishment);
    assert_eq!(new_case.address_level, AddressLevel::Establishment);
    assert_eq!(new_case.ce_expected_capacity, Some(20));
    assert!(new_case.skeleton);
    assert_eq!(new_case.address.address_line1, old.address.address_line1);
    assert_eq!(new_case.address.estab_type.as_deref(), Some("CARE HOME"));

    assert_eq!(keys(&harness, OutboundEventType::CaseUpdated), [old.case_id.to_string()]);
    assert_eq!(keys(&harness, OutboundEventType::CaseCreated), [new_case_id.to_string()]);
    assert_eq!(
        harness.store.events_for(old.case_id)[0].description,
        "Address type changed from HH to CE"
    );
}

#[tokio::test]
async fn household_individual_cannot_be_retyped() {
    let harness = Harness::new();
    let individual = fixtures::case(CaseType::HouseholdIndividual, AddressLevel::Unit, "E12000001");
    harness.store.insert_case(individual.clone());

    let body = envelope(
        EventType::AddressTypeChanged,
        json!({"addressTypeChange": {
            "newCaseId": Uuid::new_v4(),
            "collectionCase": {"id": individual.case_id, "address": {"addressType": "CE"}},
        }}),
    );
    let result = harness.apply(EventType::AddressTypeChanged, &body).await;

    assert!(matches!(result, Err(ProcessingError::InvalidCaseTypeChange { .. })));
    assert!(!harness.store.case(individual.case_id).unwrap().address_invalid);
    assert_eq!(harness.store.cases().len(), 1);
}

#[tokio::test]
async fn retyping_onto_the_same_case_id_is_rejected() {
    let harness = Harness::new();
    let old = fixtures::household_case("E12000001");
    harness.store.insert_case(old.clone());

    let body = envelope(
        EventType::AddressTypeChanged,
        json!({"addressTypeChange": {
            "newCaseId": old.case_id,
            "collectionCase": {"id": old.case_id, "address": {"addressType": "SPG"}},
        }}),
    );
    let result = harness.apply(EventType::AddressTypeChanged, &body).await;

    assert!(matches!(result, Err(ProcessingError::InvalidCaseTypeChange { .. })));
}

#[tokio::test]
async fn retyping_to_the_same_type_is_rejected() {
    let harness = Harness::new();
    let old = fixtures::household_case("E12000001");
    harness.store.insert_case(old.clone());

    let body = envelope(
        EventType::AddressTypeChanged,
        json!({"addressTypeChange": {
            "newCaseId": Uuid::new_v4(),
            "collectionCase": {"id": old.case_id, "address": {"addressType": "HH"}},
        }}),
    );
    let result = harness.apply(EventType::AddressTypeChanged, &body).await;

    assert!(matches!(result, Err(ProcessingError::InvalidAddressTypeChange { .. })));
    assert!(harness.store.outbound().is_empty());
}

#[tokio::test]
async fn new_address_without_uprn_gets_dummy_uprn_and_is_indexed() {
    let harness = Harness::new();
    let case_id = Uuid::new_v4();
    let body = envelope_from(
        EventType::NewAddressReported,
        "FIELD",
        json!({"newAddress": {"collectionCase": {
            "id": case_id,
            "caseType": "HH",
            "address": {
                "addressLevel": "U",
                "region": "E12000001",
                "addressType": "HH",
                "addressLine1": "3 New Road",
                "townName": "Exampleton",
                "postcode": "EX3 3CC",
            },
        }}}),
    );

    harness.apply(EventType::NewAddressReported, &body).await.unwrap();

    let case = harness.store.case(case_id).unwrap();
    assert!(case.skeleton);
    assert_eq!(
        case.address.uprn,
        Some(format!("{DUMMY_UPRN_PREFIX}{}", case.case_ref))
    );

    let index = harness.address_index.clone();
    assert!(eventually(Duration::from_secs(1), || index.published().len() == 1).await);
    assert_eq!(index.published()[0].case_id, case_id);

    harness.apply(EventType::NewAddressReported, &body).await.unwrap();
    assert_eq!(harness.store.cases().len(), 1);
    assert_eq!(harness.store.events_for(case_id).len(), 1);
}

#[tokio::test]
async fn new_address_with_uprn_is_not_indexed() {
    let harness = Harness::new();
    let case_id = Uuid::new_v4();
    let body = envelope(
        EventType::NewAddressReported,
        json!({"newAddress": {"collectionCase": {
            "id": case_id,
            "address": {
                "addressLevel": "U",
                "region": "W92000004",
                "addressType": "SPG",
                "addressLine1": "Caravan 4",
                "uprn": "200000000001",
            },
        }}}),
    );

    harness.apply(EventType::NewAddressReported, &body).await.unwrap();

    let case = harness.store.case(case_id).unwrap();
    assert_eq!(case.case_type, CaseType::SpecialPopulationGroup);
    assert_eq!(case.address.uprn.as_deref(), Some("200000000001"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.address_index.published().is_empty());
}

#[tokio::test]
async fn new_address_from_source_case_inherits_missing_fields() {
    let harness = Harness::new();
    let source = fixtures::household_case("E12000001");
    harness.store.insert_case(source.clone());
    let case_id = Uuid::new_v4();
    let body = envelope(
        EventType::NewAddressReported,
        json!({"newAddress": {
            "sourceCaseId": source.case_id,
            "collectionCase": {
                "id": case_id,
                "address": {
                    "addressLevel": "U",
                    "region": "E12000001",
                    "addressType": "HH",
                    "addressLine1": "1A Test Street",
                },
            },
        }}),
    );

    harness.apply(EventType::NewAddressReported, &body).await.unwrap();

    let case = harness.store.case(case_id).unwrap();
    assert_eq!(case.address.address_line1.as_deref(), Some("1A Test Street"));
    assert_eq!(case.address.postcode, source.address.postcode);
    assert_eq!(case.treatment_code, source.treatment_code);
    assert_eq!(case.field_officer_id, source.field_officer_id);
}

#[tokio::test]
async fn new_address_without_region_is_rejected() {
    let harness = Harness::new();
    let body = envelope(
        EventType::NewAddressReported,
        json!({"newAddress": {"collectionCase": {
            "id": Uuid::new_v4(),
            "address": {"addressLevel": "U", "addressType": "HH", "region": " "},
        }}}),
    );

    let result = harness.apply(EventType::NewAddressReported, &body).await;

    assert!(matches!(result, Err(ProcessingError::MissingMandatoryField(_))));
    assert!(harness.store.cases().is_empty());
}

#[tokio::test]
async fn address_modification_applies_present_fields_only() {
    let harness = Harness::new();
    let mut case = fixtures::household_case("E12000001");
    case.address.address_line2 = Some("Flat 2".to_string());
    harness.store.insert_case(case.clone());

    let body = envelope(
        EventType::AddressModified,
        json!({"addressModification": {
            "collectionCase": {"id": case.case_id},
            "newAddress": {"addressLine1": "1 Renamed Street", "addressLine2": null},
        }}),
    );
    harness.apply(EventType::AddressModified, &body).await.unwrap();

    let address = harness.store.case(case.case_id).unwrap().address;
    assert_eq!(address.address_line1.as_deref(), Some("1 Renamed Street"));
    assert_eq!(address.address_line2, None);
    assert_eq!(address.postcode, case.address.postcode);
    assert_eq!(harness.store.outbound_of(OutboundEventType::CaseUpdated).len(), 1);
}

#[tokio::test]
async fn clearing_a_mandatory_address_field_is_rejected() {
    let harness = Harness::new();
    let case = fixtures::household_case("E12000001");
    harness.store.insert_case(case.clone());

    let body = envelope(
        EventType::AddressModified,
        json!({"addressModification": {
            "collectionCase": {"id": case.case_id},
            "newAddress": {"addressLine1": null},
        }}),
    );
    let result = harness.apply(EventType::AddressModified, &body).await;

    assert!(matches!(
        result,
        Err(ProcessingError::MissingMandatoryField("newAddress.addressLine1"))
    ));
    assert_eq!(harness.store.case(case.case_id).unwrap(), case);
}

#[tokio::test]
async fn invalid_address_cancels_field_work_unless_reported_by_field() {
    let harness = Harness::new();
    let from_contact_centre = fixtures::household_case("E12000001");
    let from_field = fixtures::household_case("E12000001");
    harness.store.insert_case(from_contact_centre.clone());
    harness.store.insert_case(from_field.clone());
    let invalid = |case_id: Uuid, channel: &str| {
        envelope_from(
            EventType::AddressNotValid,
            channel,
            json!({"invalidAddress": {"reason": "DEMOLISHED", "collectionCase": {"id": case_id}}}),
        )
    };

    harness
        .apply(EventType::AddressNotValid, &invalid(from_contact_centre.case_id, "CC"))
        .await
        .unwrap();
    harness
        .apply(EventType::AddressNotValid, &invalid(from_field.case_id, "FIELD"))
        .await
        .unwrap();

    assert!(harness.store.case(from_contact_centre.case_id).unwrap().address_invalid);
    assert!(harness.store.case(from_field.case_id).unwrap().address_invalid);
    assert_eq!(
        keys(&harness, OutboundEventType::FieldCaseInstruction),
        [from_contact_centre.case_id.to_string()]
    );
}

#[tokio::test]
async fn uninvalidated_address_is_valid_again() {
    let harness = Harness::new();
    let mut case = fixtures::household_case("E12000001");
    case.address_invalid = true;
    harness.store.insert_case(case.clone());

    let body = envelope(
        EventType::RmUninvalidateAddress,
        json!({"rmUnInvalidateAddress": {"caseId": case.case_id}}),
    );
    harness.apply(EventType::RmUninvalidateAddress, &body).await.unwrap();

    assert!(!harness.store.case(case.case_id).unwrap().address_invalid);
}
