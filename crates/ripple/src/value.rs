//! Value trees.
//!
//! A [`Value`] is one decoded snapshot of a record: scalars, ordered lists,
//! insertion-ordered maps and unordered sets. Absence is never a value;
//! callers model "no snapshot" and "no key" with `Option`, so `Null` only
//! ever means an explicit null.

use crate::number::Number;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Ordered string-keyed mapping used for map values.
pub type Map = IndexMap<String, Value>;

/// A JSON-like nested value with first-class sets.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Exact decimal. See [`Number`].
    Number(Number),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(Map),
    /// Members have no defined order. Equality ignores enumeration order.
    Set(Vec<Value>),
}

impl Value {
    /// Build a set, dropping members equal to an earlier member.
    pub fn set<I: IntoIterator<Item = Value>>(members: I) -> Self {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for member in members {
            if seen.insert(canonical_key(&member)) {
                out.push(member);
            }
        }
        Value::Set(out)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Nearest `f64` of a number value.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::to_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Short name of the variant, used in log fields.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
        }
    }

    /// Look up a dotted path through nested maps.
    ///
    /// See [`crate::get_nested_value`].
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        crate::diff::get_nested_value(Some(self), path)
    }

    /// Convert to a `serde_json::Value`.
    ///
    /// Sets become arrays and binary becomes an array of byte values, so the
    /// conversion is lossy for those two variants. Numbers that are not an
    /// `i64` go through `f64`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::List(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn number_to_json(n: &Number) -> serde_json::Value {
    match n.as_i64() {
        Some(i) => serde_json::Value::from(i),
        None => serde_json::Number::from_f64(n.to_f64())
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        crate::diff::deep_equal(self, other)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n
                .to_string()
                .parse()
                .map(Value::Number)
                .unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

/// NaN and the infinities have no decimal form and become `Null`.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => number_to_json(n).serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(bytes) => bytes.serialize(serializer),
            Value::List(items) | Value::Set(items) => items.serialize(serializer),
            Value::Map(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

// ============================================================================
// Canonical serialization
// ============================================================================

/// Deterministic, type-tagged string form of a value.
///
/// Deep-equal values always share a canonical key. Map keys
/// are emitted sorted and set members are emitted sorted by their own keys,
/// so neither insertion order nor set enumeration order leaks in. Used to
/// count composite members when comparing lists and sets as multisets.
pub fn canonical_key(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "n:{n}");
        }
        Value::String(s) => {
            out.push_str("s:");
            push_quoted(s, out);
        }
        Value::Binary(bytes) => {
            out.push_str("b:");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Map(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_quoted(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Set(members) => {
            let mut keys: Vec<String> = members.iter().map(canonical_key).collect();
            keys.sort();
            keys.dedup();
            out.push('<');
            out.push_str(&keys.join(","));
            out.push('>');
        }
    }
}

fn push_quoted(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}

/// Distinct members by canonical key.
pub(crate) fn distinct(items: &[Value]) -> HashSet<String> {
    items.iter().map(canonical_key).collect()
}

/// Count members by canonical key.
pub(crate) fn multiset(items: &[Value]) -> HashMap<String, usize> {
    let mut counts = HashMap::with_capacity(items.len());
    for item in items {
        *counts.entry(canonical_key(item)).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_key_ignores_map_insertion_order() {
        let a = Value::from(json!({"x": 1, "y": [1, 2]}));
        let b = Value::from(json!({"y": [1, 2], "x": 1}));
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn canonical_key_ignores_set_order() {
        let a = Value::set(vec![Value::from("a"), Value::from("b")]);
        let b = Value::set(vec![Value::from("b"), Value::from("a")]);
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn canonical_key_separates_types() {
        assert_ne!(canonical_key(&Value::from("1")), canonical_key(&Value::from(1)));
        let list = Value::List(vec![Value::from("a")]);
        let set = Value::set(vec![Value::from("a")]);
        assert_ne!(canonical_key(&list), canonical_key(&set));
        assert_ne!(canonical_key(&Value::Null), canonical_key(&Value::from("null")));
    }

    #[test]
    fn set_constructor_drops_duplicates() {
        let set = Value::set(vec![Value::from(1), Value::from(1), Value::from(2)]);
        match set {
            Value::Set(members) => assert_eq!(members.len(), 2),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn json_round_trip_keeps_maps_and_lists() {
        let json = json!({"name": "Ada", "tags": ["a", "b"], "age": 36, "ratio": 0.5});
        let value = Value::from(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn json_numbers_convert_without_rounding() {
        let big = Value::from(json!(9_007_199_254_740_993u64));
        assert_ne!(big, Value::from(json!(9_007_199_254_740_992u64)));
        assert_eq!(big.to_json(), json!(9_007_199_254_740_993u64));
        assert_eq!(Value::from(json!(1.0)), Value::from(1));
        assert_eq!(Value::from(f64::NAN), Value::Null);
    }

    #[test]
    fn serialize_matches_to_json() {
        let value = Value::from(json!({"a": [1, {"b": null}]}));
        let serialized = serde_json::to_value(&value).unwrap();
        assert_eq!(serialized, value.to_json());
    }
}
