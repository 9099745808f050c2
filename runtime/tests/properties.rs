//! Properties of the pure case rules over generated inputs.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use census_rm_core::envelope::FIELD_CHANNEL;
use census_rm_runtime::engine::{
    BlankQuestionnaireKey, BlankQuestionnaireRule, blank_questionnaire_rule, is_eligible_for_field,
};
use census_rm_testing::fixtures;
use census_rm_testing::properties::{address_level, case_type, questionnaire_type, refusal};
use proptest::prelude::*;

proptest! {
    #[test]
    fn another_valid_receipt_keeps_the_case_receipted(
        case_type in case_type(),
        address_level in address_level(),
        questionnaire_type in questionnaire_type(),
    ) {
        let key = BlankQuestionnaireKey {
            case_type,
            address_level,
            form_type: questionnaire_type.form_type(),
            has_other_valid_receipt: true,
        };

        if let Ok(rule) = blank_questionnaire_rule(key) {
            prop_assert_eq!(rule, BlankQuestionnaireRule::NoActionRequired);
        }
    }

    #[test]
    fn refused_cases_never_go_to_field(
        case_type in case_type(),
        address_level in address_level(),
        refusal in refusal(),
    ) {
        let mut case = fixtures::case(case_type, address_level, "E12000001");
        case.refusal_received = refusal;

        if refusal.is_some() {
            prop_assert!(!is_eligible_for_field(&case, "EQ"));
        }
        prop_assert!(!is_eligible_for_field(&case, FIELD_CHANNEL));
    }

    #[test]
    fn recorded_refusal_never_downgrades(first in refusal(), second in refusal()) {
        let recorded = first.max(second);

        prop_assert!(recorded >= first);
        prop_assert!(recorded >= second);
    }
}
