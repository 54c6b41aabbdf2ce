//! Filter matching over attribute diffs.
//!
//! A handler's [`FilterSpec`] narrows which modifications it sees. Path
//! matching is ancestor-inclusive: watching `preferences` catches a change
//! at `preferences.theme`, never the other way round.

use crate::diff::{get_nested_value, AttributeDiff, ChangeKind};
use crate::error::RouterError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One or more accepted change kinds, matched with OR semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "Vec<ChangeKind>")]
pub struct ChangeKinds(SmallVec<[ChangeKind; 4]>);

impl ChangeKinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ChangeKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn insert(&mut self, kind: ChangeKind) {
        if !self.0.contains(&kind) {
            self.0.push(kind);
        }
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.0.iter().copied()
    }
}

impl From<ChangeKind> for ChangeKinds {
    fn from(kind: ChangeKind) -> Self {
        ChangeKinds::new().with(kind)
    }
}

impl FromIterator<ChangeKind> for ChangeKinds {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        let mut kinds = ChangeKinds::new();
        for kind in iter {
            kinds.insert(kind);
        }
        kinds
    }
}

impl<const N: usize> From<[ChangeKind; N]> for ChangeKinds {
    fn from(kinds: [ChangeKind; N]) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<ChangeKinds> for Vec<ChangeKind> {
    fn from(kinds: ChangeKinds) -> Self {
        kinds.0.into_vec()
    }
}

/// Accepts either `"field_cleared"` or `["field_cleared", ...]` on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(ChangeKind),
    Many(Vec<ChangeKind>),
}

impl From<OneOrMany> for ChangeKinds {
    fn from(raw: OneOrMany) -> Self {
        match raw {
            OneOrMany::One(kind) => kind.into(),
            OneOrMany::Many(kinds) => kinds.into_iter().collect(),
        }
    }
}

/// True iff the diff holds a change at `attribute` or below it whose kind is
/// accepted by `kinds`. With no `kinds`, any change at or below matches.
pub fn has_attribute_change(
    diff: &AttributeDiff,
    attribute: &str,
    kinds: Option<&ChangeKinds>,
) -> bool {
    let mut candidates = diff.iter().filter(|change| path_is_within(&change.path, attribute));
    match kinds {
        None => candidates.next().is_some(),
        Some(kinds) => candidates.any(|change| kinds.contains(change.kind)),
    }
}

fn path_is_within(path: &str, attribute: &str) -> bool {
    match path.strip_prefix(attribute) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// Handler-supplied match criteria, fixed at registration.
///
/// ```ignore
/// let filter = FilterSpec::attribute("email")
///     .change_kinds(ChangeKind::FieldCleared)
///     .old_value("x@y.com");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_kinds: Option<ChangeKinds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_field_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_field_value: Option<Value>,
}

impl FilterSpec {
    /// Filter on changes at or below `path`.
    pub fn attribute(path: impl Into<String>) -> Self {
        Self {
            attribute: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn change_kinds(mut self, kinds: impl Into<ChangeKinds>) -> Self {
        self.change_kinds = Some(kinds.into());
        self
    }

    pub fn old_value(mut self, value: impl Into<Value>) -> Self {
        self.old_field_value = Some(value.into());
        self
    }

    pub fn new_value(mut self, value: impl Into<Value>) -> Self {
        self.new_field_value = Some(value.into());
        self
    }

    fn has_value_filter(&self) -> bool {
        self.old_field_value.is_some() || self.new_field_value.is_some()
    }

    /// Reject specs that can never match.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.attribute.is_none() && self.has_value_filter() {
            return Err(RouterError::InvalidFilter {
                reason: "old/new field value filters require an attribute path".into(),
            });
        }
        if self.change_kinds.as_ref().is_some_and(ChangeKinds::is_empty) {
            return Err(RouterError::InvalidFilter {
                reason: "change kind filter is empty".into(),
            });
        }
        Ok(())
    }

    /// Evaluate the filter against a diff and the two images it came from.
    ///
    /// Value filters without an attribute never match.
    pub fn matches(&self, diff: &AttributeDiff, old: Option<&Value>, new: Option<&Value>) -> bool {
        let Some(attribute) = self.attribute.as_deref() else {
            if self.has_value_filter() {
                return false;
            }
            return match &self.change_kinds {
                Some(kinds) => diff.iter().any(|change| kinds.contains(change.kind)),
                None => true,
            };
        };

        if !has_attribute_change(diff, attribute, self.change_kinds.as_ref()) {
            return false;
        }

        let value_matches = |expected: &Option<Value>, image: Option<&Value>| match expected {
            Some(expected) => get_nested_value(image, attribute) == Some(expected),
            None => true,
        };

        value_matches(&self.old_field_value, old) && value_matches(&self.new_field_value, new)
    }
}
