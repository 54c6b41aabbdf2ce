//! Attribute wire encoding.
//!
//! Stream images arrive as type-tagged attributes (`{"S": "x"}`,
//! `{"N": "42"}`, `{"SS": ["a", "b"]}`, ...). [`unmarshall`] turns an image
//! into a [`Value`] tree; [`marshall`] goes the other way for builders and
//! fixtures. Typed sets (`SS`, `NS`, `BS`) become [`Value::Set`], which is
//! what lets the diff engine treat them order-independently.

use crate::error::CodecError;
use crate::number::Number;
use crate::value::{Map, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One image: attribute name to encoded value.
pub type AttributeMap = IndexMap<String, AttributeValue>;

/// A single type-tagged attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    /// Numbers travel as strings to keep their precision on the wire.
    /// They decode to an exact [`Number`], never through a float.
    N(String),
    /// Base64-encoded bytes.
    B(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    M(AttributeMap),
    L(Vec<AttributeValue>),
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    #[serde(rename = "NS")]
    Ns(Vec<String>),
    #[serde(rename = "BS")]
    Bs(Vec<String>),
}

/// Decode an image into a map value.
pub fn unmarshall(image: &AttributeMap) -> Result<Value, CodecError> {
    let mut map = Map::with_capacity(image.len());
    for (name, attribute) in image {
        map.insert(name.clone(), unmarshall_value(attribute)?);
    }
    Ok(Value::Map(map))
}

/// Decode one attribute.
pub fn unmarshall_value(attribute: &AttributeValue) -> Result<Value, CodecError> {
    Ok(match attribute {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => Value::Number(parse_number(n)?),
        AttributeValue::B(b) => Value::Binary(STANDARD.decode(b)?),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::M(image) => unmarshall(image)?,
        AttributeValue::L(items) => Value::List(
            items
                .iter()
                .map(unmarshall_value)
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::Ss(members) => Value::set(members.iter().cloned().map(Value::String)),
        AttributeValue::Ns(members) => Value::set(
            members
                .iter()
                .map(|n| parse_number(n).map(Value::Number))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        AttributeValue::Bs(members) => Value::set(
            members
                .iter()
                .map(|b| STANDARD.decode(b).map(Value::Binary))
                .collect::<Result<Vec<_>, _>>()?,
        ),
    })
}

fn parse_number(raw: &str) -> Result<Number, CodecError> {
    raw.parse()
}

/// Encode a map value as an image.
pub fn marshall(item: &Value) -> Result<AttributeMap, CodecError> {
    let Value::Map(map) = item else {
        return Err(CodecError::NotAMap(item.kind_name()));
    };
    map.iter()
        .map(|(name, value)| -> Result<_, CodecError> {
            Ok((name.clone(), marshall_value(value)?))
        })
        .collect()
}

/// Encode one value.
pub fn marshall_value(value: &Value) -> Result<AttributeValue, CodecError> {
    Ok(match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Binary(bytes) => AttributeValue::B(STANDARD.encode(bytes)),
        Value::List(items) => AttributeValue::L(
            items
                .iter()
                .map(marshall_value)
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(_) => AttributeValue::M(marshall(value)?),
        Value::Set(members) => marshall_set(members)?,
    })
}

fn marshall_set(members: &[Value]) -> Result<AttributeValue, CodecError> {
    match members.first() {
        None | Some(Value::String(_)) => members
            .iter()
            .map(|m| match m {
                Value::String(s) => Ok(s.clone()),
                other => Err(unsupported(other)),
            })
            .collect::<Result<_, _>>()
            .map(AttributeValue::Ss),
        Some(Value::Number(_)) => members
            .iter()
            .map(|m| match m {
                Value::Number(n) => Ok(n.to_string()),
                other => Err(unsupported(other)),
            })
            .collect::<Result<_, _>>()
            .map(AttributeValue::Ns),
        Some(Value::Binary(_)) => members
            .iter()
            .map(|m| match m {
                Value::Binary(bytes) => Ok(STANDARD.encode(bytes)),
                other => Err(unsupported(other)),
            })
            .collect::<Result<_, _>>()
            .map(AttributeValue::Bs),
        Some(other) => Err(unsupported(other)),
    }
}

fn unsupported(member: &Value) -> CodecError {
    CodecError::UnsupportedSetMember {
        kind: member.kind_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(json: serde_json::Value) -> AttributeMap {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn decodes_every_attribute_type() {
        let decoded = unmarshall(&image(json!({
            "id": {"S": "user-1"},
            "age": {"N": "36"},
            "score": {"N": "0.25"},
            "avatar": {"B": "AQID"},
            "active": {"BOOL": true},
            "deleted_at": {"NULL": true},
            "prefs": {"M": {"theme": {"S": "dark"}}},
            "history": {"L": [{"N": "1"}, {"S": "two"}]},
            "tags": {"SS": ["a", "b"]},
            "lucky": {"NS": ["7", "13"]},
            "blobs": {"BS": ["AQ=="]},
        })))
        .unwrap();

        assert_eq!(decoded.get_path("id"), Some(&Value::from("user-1")));
        assert_eq!(decoded.get_path("age"), Some(&Value::from(36)));
        assert_eq!(decoded.get_path("score"), Some(&Value::from(0.25)));
        assert_eq!(decoded.get_path("avatar"), Some(&Value::Binary(vec![1, 2, 3])));
        assert_eq!(decoded.get_path("active"), Some(&Value::from(true)));
        assert_eq!(decoded.get_path("deleted_at"), Some(&Value::Null));
        assert_eq!(decoded.get_path("prefs.theme"), Some(&Value::from("dark")));
        assert_eq!(
            decoded.get_path("history"),
            Some(&Value::List(vec![Value::from(1), Value::from("two")]))
        );
        assert_eq!(
            decoded.get_path("tags"),
            Some(&Value::set(vec![Value::from("b"), Value::from("a")]))
        );
        assert_eq!(
            decoded.get_path("lucky"),
            Some(&Value::set(vec![Value::from(13), Value::from(7)]))
        );
        assert_eq!(decoded.get_path("blobs"), Some(&Value::set(vec![Value::Binary(vec![1])])));
    }

    #[test]
    fn rejects_bad_numbers_and_base64() {
        assert!(matches!(
            unmarshall(&image(json!({"n": {"N": "forty"}}))),
            Err(CodecError::InvalidNumber(_))
        ));
        assert!(matches!(
            unmarshall(&image(json!({"b": {"B": "***"}}))),
            Err(CodecError::InvalidBinary(_))
        ));
        assert!(matches!(
            unmarshall(&image(json!({"n": {"NS": ["1", "NaN"]}}))),
            Err(CodecError::InvalidNumber(_))
        ));
    }

    #[test]
    fn large_numbers_keep_every_digit() {
        let old = unmarshall(&image(json!({"id": {"N": "9007199254740992"}}))).unwrap();
        let new = unmarshall(&image(json!({"id": {"N": "9007199254740993"}}))).unwrap();

        let diff = crate::diff_attributes(Some(&old), Some(&new));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes()[0].path, "id");

        let encoded = marshall(&new).unwrap();
        assert_eq!(encoded["id"], AttributeValue::N("9007199254740993".to_string()));
    }

    #[test]
    fn equal_numbers_spelled_differently_do_not_diff() {
        let old = unmarshall(&image(json!({"price": {"N": "10.50"}, "qty": {"NS": ["1", "2"]}})))
            .unwrap();
        let new = unmarshall(&image(json!({"price": {"N": "1.05E1"}, "qty": {"NS": ["2.0", "1"]}})))
            .unwrap();
        assert!(!crate::diff_attributes(Some(&old), Some(&new)).has_changes());
        assert_eq!(
            marshall(&new).unwrap()["price"],
            AttributeValue::N("10.5".to_string())
        );
    }

    #[test]
    fn sets_survive_marshalling() {
        let original = image(json!({
            "tags": {"SS": ["a", "b"]},
            "nums": {"NS": ["1", "2.5"]},
            "nested": {"M": {"l": {"L": [{"BOOL": false}, {"NULL": true}]}}},
        }));
        let value = unmarshall(&original).unwrap();
        let encoded = marshall(&value).unwrap();
        assert_eq!(encoded, original);
    }

    #[test]
    fn marshall_rejects_non_map_roots_and_mixed_sets() {
        assert!(matches!(marshall(&Value::from("x")), Err(CodecError::NotAMap("string"))));

        let mixed = Value::Set(vec![Value::from("a"), Value::from(1)]);
        assert!(matches!(
            marshall_value(&mixed),
            Err(CodecError::UnsupportedSetMember { kind: "number" })
        ));
    }

    #[test]
    fn wire_shape_is_type_tagged() {
        let encoded = marshall_value(&Value::set(vec![Value::from("a")])).unwrap();
        assert_eq!(serde_json::to_value(encoded).unwrap(), json!({"SS": ["a"]}));
        let encoded = marshall_value(&Value::Null).unwrap();
        assert_eq!(serde_json::to_value(encoded).unwrap(), json!({"NULL": true}));
    }
}
