//! Column values and their RFC 7047 wire encoding.
//!
//! A value carries its kind explicitly, so upper layers never have to
//! downcast. Sets follow the protocol's collapsing rule: a set holding
//! exactly one element is stored (and transmitted) as the bare scalar.

use std::collections::BTreeMap;
use std::fmt;

use serde::de;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// One row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// A column value in its cached and wire representation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent optional scalar. Encodes as the empty set on the wire.
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    /// Reference to a committed row.
    Uuid(Uuid),
    /// Reference to a row inserted earlier in the same transaction.
    NamedUuid(String),
    Set(Vec<Value>),
    /// Map keys are restricted to strings; that is all the modeled schemas use.
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Str(_) => "string",
            Value::Uuid(_) => "uuid",
            Value::NamedUuid(_) => "named-uuid",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Decode a string set, accepting the collapsed single-scalar form.
    pub fn string_set(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::Set(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Decode a reference set, accepting the collapsed single-scalar form.
    pub fn uuid_set(&self) -> Vec<Uuid> {
        match self {
            Value::Uuid(u) => vec![*u],
            Value::Set(items) => items.iter().filter_map(Value::as_uuid).collect(),
            _ => Vec::new(),
        }
    }

    /// Decode a string-to-string map, skipping non-string values.
    pub fn string_map(&self) -> BTreeMap<String, String> {
        match self {
            Value::Map(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Optional string column (0..1 set, possibly collapsed).
    pub fn opt_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Set(items) if items.len() == 1 => items[0].as_str(),
            _ => None,
        }
    }

    /// Optional boolean column (0..1 set, possibly collapsed).
    pub fn opt_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Set(items) if items.len() == 1 => items[0].as_bool(),
            _ => None,
        }
    }

    /// Optional integer column (0..1 set, possibly collapsed).
    pub fn opt_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Set(items) if items.len() == 1 => items[0].as_integer(),
            _ => None,
        }
    }

    /// Optional reference column (0..1 set, possibly collapsed).
    pub fn opt_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            Value::Set(items) if items.len() == 1 => items[0].as_uuid(),
            _ => None,
        }
    }

    /// Build a set value from strings without collapsing.
    pub fn set_of_strings<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(items.into_iter().map(|s| Value::Str(s.into())).collect())
    }

    /// Build a map value from string pairs.
    pub fn map_of_strings<I, K, V>(pairs: I) -> Value
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Value::Str(v.into())))
                .collect(),
        )
    }

    /// Parse one wire value.
    pub fn from_wire(raw: &serde_json::Value) -> Result<Value, Error> {
        use serde_json::Value as J;
        match raw {
            J::Null => Ok(Value::Null),
            J::Bool(b) => Ok(Value::Bool(*b)),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(Error::Frame(format!("unrepresentable number {n}")))
                }
            }
            J::String(s) => Ok(Value::Str(s.clone())),
            J::Array(items) => Self::from_wire_array(items),
            J::Object(_) => Err(Error::Frame("unexpected object value".into())),
        }
    }

    fn from_wire_array(items: &[serde_json::Value]) -> Result<Value, Error> {
        use serde_json::Value as J;
        let (tag, body) = match items {
            [J::String(tag), body] => (tag.as_str(), body),
            _ => {
                return Err(Error::Frame(
                    "array value must be a [tag, body] pair".into(),
                ))
            }
        };
        match (tag, body) {
            ("uuid", J::String(s)) => Uuid::parse_str(s)
                .map(Value::Uuid)
                .map_err(|e| Error::Frame(format!("bad uuid {s:?}: {e}"))),
            ("named-uuid", J::String(s)) => Ok(Value::NamedUuid(s.clone())),
            ("set", J::Array(elems)) => {
                let mut set = Vec::with_capacity(elems.len());
                for elem in elems {
                    set.push(Value::from_wire(elem)?);
                }
                Ok(Value::Set(set))
            }
            ("map", J::Array(pairs)) => {
                let mut map = BTreeMap::new();
                for pair in pairs {
                    let (k, v) = match pair.as_array().map(Vec::as_slice) {
                        Some([k, v]) => (k, v),
                        _ => return Err(Error::Frame("map entry must be a pair".into())),
                    };
                    let key = match k {
                        J::String(s) => s.clone(),
                        other => {
                            return Err(Error::Frame(format!(
                                "unsupported map key {other}; only string keys are handled"
                            )))
                        }
                    };
                    map.insert(key, Value::from_wire(v)?);
                }
                Ok(Value::Map(map))
            }
            _ => Err(Error::Frame(format!("unknown value tag {tag:?}"))),
        }
    }
}

impl fmt::Display for Value {
    /// Human-readable rendering, also used for substring matches against
    /// formatted reference columns.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("[]"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Str(s) => f.write_str(s),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::NamedUuid(n) => f.write_str(n),
            Value::Set(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => Value::Set(Vec::new()).serialize(serializer),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Real(r) => serializer.serialize_f64(*r),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Uuid(u) => ("uuid", u.to_string()).serialize(serializer),
            Value::NamedUuid(n) => ("named-uuid", n.as_str()).serialize(serializer),
            Value::Set(items) => ("set", items).serialize(serializer),
            Value::Map(map) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("map")?;
                let pairs: Vec<(&String, &Value)> = map.iter().collect();
                seq.serialize_element(&pairs)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_wire(&raw).map_err(de::Error::custom)
    }
}

/// Apply the 0..1 collapsing rule to a freshly built set.
pub fn collapse_set(mut items: Vec<Value>) -> Value {
    if items.len() == 1 {
        items.remove(0)
    } else {
        Value::Set(items)
    }
}

/// Toggle one element's membership, swap-removing on a hit.
pub fn toggle_set_element(set: &mut Vec<Value>, elem: &Value) {
    if let Some(i) = set.iter().position(|v| v == elem) {
        set.swap_remove(i);
    } else {
        set.push(elem.clone());
    }
}

/// Rewrite integral reals as integers across a row's top-level columns.
///
/// Some encoders transmit every number as a float; an integer column then
/// arrives as, say, 5.0 and would never compare equal to a cached 5.
pub fn normalize_integral_reals(row: &mut Row) {
    for value in row.values_mut() {
        if let Value::Real(r) = value {
            let n = *r as i64;
            if n as f64 == *r {
                *value = Value::Integer(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(v: serde_json::Value) -> Value {
        Value::from_wire(&v).expect("decode")
    }

    #[test]
    fn scalars_keep_their_kind() {
        assert_eq!(wire(json!("ls0")), Value::Str("ls0".into()));
        assert_eq!(wire(json!(7)), Value::Integer(7));
        assert_eq!(wire(json!(7.5)), Value::Real(7.5));
        assert_eq!(wire(json!(true)), Value::Bool(true));
    }

    #[test]
    fn tagged_forms_decode() {
        let id = "7a3e4c2e-78cf-4a8d-a6b4-b6a1f53a43f1";
        assert_eq!(
            wire(json!(["uuid", id])),
            Value::Uuid(Uuid::parse_str(id).unwrap())
        );
        assert_eq!(
            wire(json!(["named-uuid", "row1"])),
            Value::NamedUuid("row1".into())
        );
        assert_eq!(
            wire(json!(["set", ["a", "b"]])),
            Value::Set(vec![Value::Str("a".into()), Value::Str("b".into())])
        );
        let map = wire(json!(["map", [["k", "v"]]]));
        assert_eq!(map.string_map().get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn bad_shapes_are_rejected() {
        assert!(Value::from_wire(&json!(["set"])).is_err());
        assert!(Value::from_wire(&json!(["frob", []])).is_err());
        assert!(Value::from_wire(&json!(["map", [[1, "v"]]])).is_err());
        assert!(Value::from_wire(&json!({"k": "v"})).is_err());
    }

    #[test]
    fn encode_matches_wire_format() {
        let set = Value::Set(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(serde_json::to_value(&set).unwrap(), json!(["set", [1, 2]]));
        let map = Value::map_of_strings([("a", "1")]);
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            json!(["map", [["a", "1"]]])
        );
        assert_eq!(serde_json::to_value(Value::Null).unwrap(), json!(["set", []]));
    }

    #[test]
    fn collapse_keeps_singletons_bare() {
        assert_eq!(collapse_set(vec![Value::Integer(3)]), Value::Integer(3));
        assert_eq!(collapse_set(Vec::new()), Value::Set(Vec::new()));
        assert_eq!(
            collapse_set(vec![Value::Integer(1), Value::Integer(2)]),
            Value::Set(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn toggle_is_its_own_inverse() {
        let mut set = vec![Value::Str("a".into())];
        let elem = Value::Str("b".into());
        toggle_set_element(&mut set, &elem);
        assert!(set.contains(&elem));
        toggle_set_element(&mut set, &elem);
        assert!(!set.contains(&elem));
        assert_eq!(set, vec![Value::Str("a".into())]);
    }

    #[test]
    fn integral_reals_become_integers() {
        let mut row = Row::new();
        row.insert("n".into(), Value::Real(5.0));
        row.insert("f".into(), Value::Real(5.5));
        normalize_integral_reals(&mut row);
        assert_eq!(row["n"], Value::Integer(5));
        assert_eq!(row["f"], Value::Real(5.5));
    }

    #[test]
    fn display_formats_nested_values() {
        let id = Uuid::parse_str("7a3e4c2e-78cf-4a8d-a6b4-b6a1f53a43f1").unwrap();
        let set = Value::Set(vec![Value::Uuid(id), Value::Str("x".into())]);
        let text = set.to_string();
        assert!(text.contains("7a3e4c2e-78cf-4a8d-a6b4-b6a1f53a43f1"));
        assert_eq!(
            Value::map_of_strings([("a", "1"), ("b", "2")]).to_string(),
            "{a=1, b=2}"
        );
    }

    #[test]
    fn optional_accessors_accept_both_forms() {
        let bare = Value::Str("dyn".into());
        let boxed = Value::Set(vec![Value::Str("dyn".into())]);
        assert_eq!(bare.opt_str(), Some("dyn"));
        assert_eq!(boxed.opt_str(), Some("dyn"));
        assert_eq!(Value::Set(Vec::new()).opt_str(), None);
        assert_eq!(Value::Null.opt_bool(), None);
    }
}
