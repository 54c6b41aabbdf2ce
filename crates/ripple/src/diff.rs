//! Attribute diffing.
//!
//! [`diff_attributes`] walks the union of keys of two value trees and
//! produces one [`AttributeChange`] per detected difference, tagged with a
//! [`ChangeKind`] and a dotted path.
//!
//! ```text
//! old: { status: "pending", prefs: { theme: "light" }, tags: <a, b> }
//! new: { status: "active",  prefs: { theme: "dark"  }, tags: <a, b, c> }
//!
//! status       changed_attribute
//! prefs        changed_attribute        (map parent is kept...)
//! prefs.theme  changed_attribute        (...and the walk recurses)
//! tags         new_item_in_collection   (collections never recurse)
//! ```
//!
//! The engine is total: any pair of optional trees yields a diff, and
//! heterogeneous types at a path are a `changed_attribute`, not an error.

use crate::value::{distinct, multiset, Map, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of a single change. Exactly one kind per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Key absent in old, present in new.
    NewAttribute,
    /// Key present in old, absent in new.
    RemoveAttribute,
    /// Key present in both, old non-null, new exactly null.
    FieldCleared,
    /// Key present in both with differing values, not covered by another kind.
    ChangedAttribute,
    /// Same collection kind on both sides, members only added.
    NewItemInCollection,
    /// Same collection kind on both sides, members only removed.
    RemoveItemFromCollection,
    /// Same collection kind on both sides, members added and removed, or
    /// moved or rewritten in place.
    ChangedItemInCollection,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 7] = [
        ChangeKind::NewAttribute,
        ChangeKind::RemoveAttribute,
        ChangeKind::FieldCleared,
        ChangeKind::ChangedAttribute,
        ChangeKind::NewItemInCollection,
        ChangeKind::RemoveItemFromCollection,
        ChangeKind::ChangedItemInCollection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NewAttribute => "new_attribute",
            ChangeKind::RemoveAttribute => "remove_attribute",
            ChangeKind::FieldCleared => "field_cleared",
            ChangeKind::ChangedAttribute => "changed_attribute",
            ChangeKind::NewItemInCollection => "new_item_in_collection",
            ChangeKind::RemoveItemFromCollection => "remove_item_from_collection",
            ChangeKind::ChangedItemInCollection => "changed_item_in_collection",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown change kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown change kind `{0}`")]
pub struct UnknownChangeKind(pub String);

impl FromStr for ChangeKind {
    type Err = UnknownChangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownChangeKind(s.to_string()))
    }
}

/// One detected difference at a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Ordered list of changes between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    changes: Vec<AttributeChange>,
}

impl AttributeDiff {
    /// True iff at least one change was detected.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changes(&self) -> &[AttributeChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttributeChange> {
        self.changes.iter()
    }

    pub fn into_changes(self) -> Vec<AttributeChange> {
        self.changes
    }

    /// The change recorded exactly at `path`, if any.
    pub fn at_path(&self, path: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.path == path)
    }
}

impl<'a> IntoIterator for &'a AttributeDiff {
    type Item = &'a AttributeChange;
    type IntoIter = std::slice::Iter<'a, AttributeChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl From<Vec<AttributeChange>> for AttributeDiff {
    fn from(changes: Vec<AttributeChange>) -> Self {
        Self { changes }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Compute the structural diff between two optional snapshots.
///
/// A missing snapshot, or a root that is not a map, contributes no keys.
/// Keys are visited old-first in their order, then keys only present in new.
pub fn diff_attributes(old: Option<&Value>, new: Option<&Value>) -> AttributeDiff {
    let mut changes = Vec::new();
    diff_maps(
        old.and_then(Value::as_map),
        new.and_then(Value::as_map),
        "",
        &mut changes,
    );
    AttributeDiff { changes }
}

fn diff_maps(old: Option<&Map>, new: Option<&Map>, prefix: &str, out: &mut Vec<AttributeChange>) {
    if let Some(old) = old {
        for (key, old_value) in old {
            let path = join_path(prefix, key);
            match new.and_then(|n| n.get(key)) {
                None => out.push(AttributeChange {
                    path,
                    kind: ChangeKind::RemoveAttribute,
                    old_value: Some(old_value.clone()),
                    new_value: None,
                }),
                Some(new_value) => diff_present(old_value, new_value, path, out),
            }
        }
    }

    if let Some(new) = new {
        for (key, new_value) in new {
            if old.is_some_and(|o| o.contains_key(key)) {
                continue;
            }
            out.push(AttributeChange {
                path: join_path(prefix, key),
                kind: ChangeKind::NewAttribute,
                old_value: None,
                new_value: Some(new_value.clone()),
            });
        }
    }
}

fn diff_present(old: &Value, new: &Value, path: String, out: &mut Vec<AttributeChange>) {
    if deep_equal(old, new) {
        return;
    }

    let changed = |kind| AttributeChange {
        path: path.clone(),
        kind,
        old_value: Some(old.clone()),
        new_value: Some(new.clone()),
    };

    if !old.is_null() && new.is_null() {
        out.push(changed(ChangeKind::FieldCleared));
        return;
    }

    match (old, new) {
        (Value::List(_), Value::List(_)) | (Value::Set(_), Value::Set(_)) => {
            if let Some(kind) = collection_change(old, new) {
                out.push(changed(kind));
            }
        }
        (Value::Map(old_map), Value::Map(new_map)) => {
            out.push(changed(ChangeKind::ChangedAttribute));
            diff_maps(Some(old_map), Some(new_map), &path, out);
        }
        _ => out.push(changed(ChangeKind::ChangedAttribute)),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Structural equality.
///
/// Lists compare in order, sets by their distinct members regardless of
/// enumeration order, maps by key set and values. Numbers compare as exact
/// decimals. `Null` only equals `Null`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Set(x), Value::Set(y)) => distinct(x) == distinct(y),
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| deep_equal(l, r)))
        }
        _ => false,
    }
}

/// Classify the difference between two collections of the same kind.
///
/// Only list/list and set/set pairs are collections here; every other pair
/// returns `None`. Callers are expected to have ruled out deep equality.
pub fn collection_change(old: &Value, new: &Value) -> Option<ChangeKind> {
    match (old, new) {
        (Value::List(old_items), Value::List(new_items)) => list_change(old_items, new_items),
        (Value::Set(old_members), Value::Set(new_members)) => {
            set_change(old_members, new_members)
        }
        _ => None,
    }
}

fn list_change(old: &[Value], new: &[Value]) -> Option<ChangeKind> {
    let old_counts = multiset(old);
    let new_counts = multiset(new);

    let added = new_counts
        .iter()
        .any(|(key, n)| *n > old_counts.get(key).copied().unwrap_or(0));
    let removed = old_counts
        .iter()
        .any(|(key, n)| *n > new_counts.get(key).copied().unwrap_or(0));

    let changed_in_place = old.iter().zip(new).any(|(o, n)| {
        !deep_equal(o, n)
            && !new_counts.contains_key(&crate::value::canonical_key(o))
            && !old_counts.contains_key(&crate::value::canonical_key(n))
    });

    if changed_in_place {
        return Some(ChangeKind::ChangedItemInCollection);
    }
    match (added, removed) {
        (true, false) => Some(ChangeKind::NewItemInCollection),
        (false, true) => Some(ChangeKind::RemoveItemFromCollection),
        (true, true) => Some(ChangeKind::ChangedItemInCollection),
        // Same multiset in a different order. Lists are position-sensitive,
        // so a reorder is still a change.
        (false, false) if !deep_equal_lists(old, new) => {
            Some(ChangeKind::ChangedItemInCollection)
        }
        (false, false) => None,
    }
}

fn deep_equal_lists(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(l, r)| deep_equal(l, r))
}

fn set_change(old: &[Value], new: &[Value]) -> Option<ChangeKind> {
    let old_members = distinct(old);
    let new_members = distinct(new);

    let added = !new_members.is_subset(&old_members);
    let removed = !old_members.is_subset(&new_members);

    match (added, removed) {
        (true, false) => Some(ChangeKind::NewItemInCollection),
        (false, true) => Some(ChangeKind::RemoveItemFromCollection),
        (true, true) => Some(ChangeKind::ChangedItemInCollection),
        (false, false) => None,
    }
}

/// Walk `path` segment by segment through nested maps.
///
/// Returns `None` when the tree is absent or any segment before the last is
/// missing, null, or not a map. An explicit null at the final segment is
/// returned as `Some(&Value::Null)`.
pub fn get_nested_value<'a>(tree: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    let mut current = tree?;
    for segment in path.split('.') {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    fn set_of(items: &[&str]) -> Value {
        Value::set(items.iter().map(|s| Value::from(*s)))
    }

    fn map_with(key: &str, value: Value) -> Value {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        Value::Map(map)
    }

    #[test]
    fn scalar_change_is_reported_with_both_values() {
        let diff = diff_attributes(
            Some(&v(json!({"status": "pending"}))),
            Some(&v(json!({"status": "active"}))),
        );

        assert_eq!(diff.len(), 1);
        let change = &diff.changes()[0];
        assert_eq!(change.path, "status");
        assert_eq!(change.kind, ChangeKind::ChangedAttribute);
        assert_eq!(change.old_value, Some(Value::from("pending")));
        assert_eq!(change.new_value, Some(Value::from("active")));
    }

    #[test]
    fn nested_map_change_keeps_parent_and_child() {
        let diff = diff_attributes(
            Some(&v(json!({"preferences": {"theme": "light"}}))),
            Some(&v(json!({"preferences": {"theme": "dark"}}))),
        );

        let paths: Vec<_> = diff.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            paths,
            vec![
                ("preferences", ChangeKind::ChangedAttribute),
                ("preferences.theme", ChangeKind::ChangedAttribute),
            ]
        );
    }

    #[test]
    fn deeply_nested_paths_are_dotted() {
        let diff = diff_attributes(
            Some(&v(json!({"a": {"b": {"c": 1}}}))),
            Some(&v(json!({"a": {"b": {"c": 2, "d": true}}}))),
        );

        assert!(diff.at_path("a.b.c").is_some());
        assert_eq!(diff.at_path("a.b.d").unwrap().kind, ChangeKind::NewAttribute);
        assert_eq!(diff.at_path("a.b").unwrap().kind, ChangeKind::ChangedAttribute);
    }

    #[test]
    fn new_and_removed_attributes_do_not_recurse() {
        let diff = diff_attributes(
            Some(&v(json!({"gone": {"x": 1}}))),
            Some(&v(json!({"added": {"y": 2}}))),
        );

        assert_eq!(diff.len(), 2);
        assert_eq!(diff.changes()[0].path, "gone");
        assert_eq!(diff.changes()[0].kind, ChangeKind::RemoveAttribute);
        assert_eq!(diff.changes()[0].new_value, None);
        assert_eq!(diff.changes()[1].path, "added");
        assert_eq!(diff.changes()[1].kind, ChangeKind::NewAttribute);
        assert_eq!(diff.changes()[1].old_value, None);
    }

    #[test]
    fn old_keys_are_visited_before_new_only_keys() {
        let diff = diff_attributes(
            Some(&v(json!({"b": 1, "a": 1}))),
            Some(&v(json!({"z": 1, "a": 2}))),
        );

        let paths: Vec<_> = diff.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "a", "z"]);
    }

    #[test]
    fn field_cleared_only_for_non_null_to_null() {
        let cleared = diff_attributes(
            Some(&v(json!({"email": "x@y.com"}))),
            Some(&v(json!({"email": null}))),
        );
        assert_eq!(cleared.changes()[0].kind, ChangeKind::FieldCleared);
        assert_eq!(cleared.changes()[0].new_value, Some(Value::Null));

        let filled = diff_attributes(
            Some(&v(json!({"email": null}))),
            Some(&v(json!({"email": "x@y.com"}))),
        );
        assert_eq!(filled.changes()[0].kind, ChangeKind::ChangedAttribute);

        let added_null = diff_attributes(Some(&v(json!({}))), Some(&v(json!({"email": null}))));
        assert_eq!(added_null.changes()[0].kind, ChangeKind::NewAttribute);
    }

    #[test]
    fn clearing_a_map_does_not_recurse() {
        let diff = diff_attributes(
            Some(&v(json!({"address": {"city": "Oslo"}}))),
            Some(&v(json!({"address": null}))),
        );
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes()[0].kind, ChangeKind::FieldCleared);
    }

    #[test]
    fn type_change_is_changed_attribute() {
        let diff = diff_attributes(
            Some(&v(json!({"a": "1", "b": {"x": 1}, "c": [1]}))),
            Some(&v(json!({"a": 1, "b": "flat", "c": {"0": 1}}))),
        );
        assert_eq!(diff.len(), 3);
        assert!(diff.iter().all(|c| c.kind == ChangeKind::ChangedAttribute));
    }

    #[test]
    fn list_and_set_are_not_the_same_collection_kind() {
        let old = map_with("tags", Value::List(vec![Value::from("a")]));
        let new = map_with("tags", set_of(&["a", "b"]));
        let diff = diff_attributes(Some(&old), Some(&new));
        assert_eq!(diff.changes()[0].kind, ChangeKind::ChangedAttribute);
    }

    #[test]
    fn set_addition_is_new_item() {
        let old = map_with("tags", set_of(&["a", "b"]));
        let new = map_with("tags", set_of(&["a", "b", "c"]));
        let diff = diff_attributes(Some(&old), Some(&new));

        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes()[0].path, "tags");
        assert_eq!(diff.changes()[0].kind, ChangeKind::NewItemInCollection);
    }

    #[test]
    fn set_removal_and_swap() {
        let old = map_with("tags", set_of(&["a", "b"]));
        let removed = map_with("tags", set_of(&["a"]));
        let swapped = map_with("tags", set_of(&["a", "c"]));

        assert_eq!(
            diff_attributes(Some(&old), Some(&removed)).changes()[0].kind,
            ChangeKind::RemoveItemFromCollection
        );
        assert_eq!(
            diff_attributes(Some(&old), Some(&swapped)).changes()[0].kind,
            ChangeKind::ChangedItemInCollection
        );
    }

    #[test]
    fn set_enumeration_order_is_not_a_change() {
        let old = map_with("tags", set_of(&["a", "b", "c"]));
        let new = map_with("tags", set_of(&["c", "a", "b"]));
        assert!(!diff_attributes(Some(&old), Some(&new)).has_changes());
    }

    #[test]
    fn list_append_and_truncate() {
        let appended = diff_attributes(
            Some(&v(json!({"items": [1, 2]}))),
            Some(&v(json!({"items": [1, 2, 3]}))),
        );
        assert_eq!(appended.changes()[0].kind, ChangeKind::NewItemInCollection);

        let truncated = diff_attributes(
            Some(&v(json!({"items": [1, 2, 3]}))),
            Some(&v(json!({"items": [1, 3]}))),
        );
        assert_eq!(truncated.changes()[0].kind, ChangeKind::RemoveItemFromCollection);
    }

    #[test]
    fn list_item_rewritten_in_place() {
        let diff = diff_attributes(
            Some(&v(json!({"items": [{"id": 1, "qty": 1}, {"id": 2, "qty": 1}]}))),
            Some(&v(json!({"items": [{"id": 1, "qty": 5}, {"id": 2, "qty": 1}]}))),
        );
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes()[0].kind, ChangeKind::ChangedItemInCollection);
    }

    #[test]
    fn list_reorder_is_changed_item() {
        let diff = diff_attributes(
            Some(&v(json!({"items": ["a", "b", "c"]}))),
            Some(&v(json!({"items": ["c", "a", "b"]}))),
        );
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes()[0].kind, ChangeKind::ChangedItemInCollection);
    }

    #[test]
    fn list_duplicate_counts_matter() {
        let diff = diff_attributes(
            Some(&v(json!({"items": ["a"]}))),
            Some(&v(json!({"items": ["a", "a"]}))),
        );
        assert_eq!(diff.changes()[0].kind, ChangeKind::NewItemInCollection);
    }

    #[test]
    fn absent_and_non_map_roots_contribute_no_keys() {
        let insert = diff_attributes(None, Some(&v(json!({"id": 1, "name": "x"}))));
        assert_eq!(insert.len(), 2);
        assert!(insert.iter().all(|c| c.kind == ChangeKind::NewAttribute));

        let remove = diff_attributes(Some(&v(json!({"id": 1}))), None);
        assert_eq!(remove.changes()[0].kind, ChangeKind::RemoveAttribute);

        assert!(!diff_attributes(None, None).has_changes());
        assert!(!diff_attributes(Some(&Value::from("scalar")), Some(&Value::from(3))).has_changes());
    }

    #[test]
    fn deep_equal_distinguishes_null_from_other_values() {
        assert!(deep_equal(&Value::Null, &Value::Null));
        assert!(!deep_equal(&Value::Null, &Value::from(false)));
        assert!(!deep_equal(&Value::Null, &Value::from("")));
        assert!(!deep_equal(&Value::Null, &Value::from(0)));
    }

    #[test]
    fn deep_equal_sets_with_composite_members() {
        let a = Value::Set(vec![v(json!({"k": 1, "j": 2})), v(json!([1, 2]))]);
        let b = Value::Set(vec![v(json!([1, 2])), v(json!({"j": 2, "k": 1}))]);
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn duplicate_set_members_count_once() {
        let twice = Value::Set(vec![Value::from("a"), Value::from("a")]);
        let once = Value::set(vec![Value::from("a")]);
        assert!(deep_equal(&twice, &once));
        assert_eq!(crate::canonical_key(&twice), crate::canonical_key(&once));
        assert_eq!(collection_change(&twice, &once), None);
        assert!(!diff_attributes(Some(&map_with("s", twice)), Some(&map_with("s", once)))
            .has_changes());
    }

    #[test]
    fn non_finite_and_signed_zero_numbers_do_not_diff() {
        let tree = map_with(
            "x",
            Value::List(vec![Value::from(f64::NAN), Value::from(f64::INFINITY), Value::from(-0.0)]),
        );
        assert!(deep_equal(&tree, &tree.clone()));
        assert!(!diff_attributes(Some(&tree), Some(&tree.clone())).has_changes());

        let negative_zero = map_with("x", Value::from(-0.0));
        let zero = map_with("x", Value::from(0));
        assert!(!diff_attributes(Some(&negative_zero), Some(&zero)).has_changes());
    }

    #[test]
    fn deep_equal_lists_are_ordered() {
        assert!(!deep_equal(&v(json!([1, 2])), &v(json!([2, 1]))));
    }

    #[test]
    fn get_nested_value_walks_maps_only() {
        let tree = v(json!({"a": {"b": {"c": 42}}, "n": null, "l": [{"x": 1}]}));
        assert_eq!(get_nested_value(Some(&tree), "a.b.c"), Some(&Value::from(42)));
        assert_eq!(get_nested_value(Some(&tree), "a.b"), Some(&v(json!({"c": 42}))));
        assert_eq!(get_nested_value(Some(&tree), "n"), Some(&Value::Null));
        assert_eq!(get_nested_value(Some(&tree), "n.x"), None);
        assert_eq!(get_nested_value(Some(&tree), "l.0.x"), None);
        assert_eq!(get_nested_value(Some(&tree), "a.missing.c"), None);
        assert_eq!(get_nested_value(None, "a"), None);
    }

    #[test]
    fn change_kind_names_round_trip() {
        for kind in ChangeKind::ALL {
            assert_eq!(kind.as_str().parse::<ChangeKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
        assert!("nope".parse::<ChangeKind>().is_err());
    }
}
