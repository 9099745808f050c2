//! Three-state values for partial updates.
//!
//! JSON partial updates distinguish a field that is absent (leave untouched)
//! from a field that is present but `null` (clear it). A plain `Option<T>`
//! collapses the two, so partial update payloads use [`Patch<T>`] instead.
//!
//! Fields of this type must carry `#[serde(default)]` so that a missing key
//! deserializes to [`Patch::Absent`].
//!
//! ```
//! use census_rm_core::patch::Patch;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Update {
//!     #[serde(default)]
//!     town: Patch<String>,
//! }
//!
//! let absent: Update = serde_json::from_str("{}").unwrap();
//! let null: Update = serde_json::from_str(r#"{"town": null}"#).unwrap();
//! let value: Update = serde_json::from_str(r#"{"town": "Exeter"}"#).unwrap();
//!
//! assert_eq!(absent.town, Patch::Absent);
//! assert_eq!(null.town, Patch::Null);
//! assert_eq!(value.town, Patch::Value("Exeter".to_string()));
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A field in a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    /// Key not present; leave the target untouched
    #[default]
    Absent,
    /// Key present with `null`; clear the target
    Null,
    /// Key present with a value; set the target
    Value(T),
}

impl<T> Patch<T> {
    /// True if the key was not present.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// True if the key was present with `null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the value, if any.
    #[must_use]
    pub const fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent | Self::Null => None,
        }
    }

    /// Apply this patch to an optional target.
    ///
    /// Returns `true` if the target was written.
    pub fn apply_to(self, target: &mut Option<T>) -> bool {
        match self {
            Self::Absent => false,
            Self::Null => {
                *target = None;
                true
            },
            Self::Value(v) => {
                *target = Some(v);
                true
            },
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Self::Value)
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Only called when the key is present; `#[serde(default)]` covers absence.
        Option::<T>::deserialize(deserializer).map(Into::into)
    }
}

impl<T> Serialize for Patch<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Value(v) => serializer.serialize_some(v),
            Self::Absent | Self::Null => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(default)]
        field: Patch<String>,
    }

    #[test]
    fn apply_leaves_target_untouched_when_absent() {
        let mut target = Some("old".to_string());
        assert!(!Patch::<String>::Absent.apply_to(&mut target));
        assert_eq!(target.as_deref(), Some("old"));
    }

    #[test]
    fn apply_clears_target_when_null() {
        let mut target = Some("old".to_string());
        assert!(Patch::<String>::Null.apply_to(&mut target));
        assert_eq!(target, None);
    }

    #[test]
    fn deserializes_three_states() {
        let absent: Holder = serde_json::from_str("{}").unwrap();
        let null: Holder = serde_json::from_str(r#"{"field":null}"#).unwrap();
        let value: Holder = serde_json::from_str(r#"{"field":"x"}"#).unwrap();
        assert!(absent.field.is_absent());
        assert!(null.field.is_null());
        assert_eq!(value.field.as_value().map(String::as_str), Some("x"));
    }

    proptest! {
        #[test]
        fn present_values_always_overwrite(old in proptest::option::of(".*"), new in ".*") {
            let mut target = old;
            Patch::Value(new.clone()).apply_to(&mut target);
            prop_assert_eq!(target, Some(new));
        }
    }
}
