//! JSON value navigation and lossy scalar coercion.
//!
//! Payload values are [`serde_json::Value`] trees. Reads never fail on
//! missing keys (they yield `null`); writes materialize missing object keys.
//! Indexing is stricter: an index must address an existing array element.

use serde_json::{Map, Value};
use std::fmt;

use crate::error::{CoreError, Result};

/// One step of a nested payload path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "[{:?}]", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read the value at `path` below `root`.
///
/// A missing key, or a key looked up inside `null`, reads as `null`.
pub fn resolve(root: &Value, path: &[PathSegment]) -> Result<Value> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        match (segment, current) {
            (PathSegment::Key(_), Value::Null) => return Ok(Value::Null),
            (PathSegment::Key(key), Value::Object(map)) => match map.get(key) {
                Some(next) => current = next,
                None => return Ok(Value::Null),
            },
            (PathSegment::Index(index), Value::Array(items)) => match items.get(*index) {
                Some(next) => current = next,
                None => {
                    return Err(CoreError::AddressingError(format!(
                        "index {} out of range (len {}) at depth {}",
                        index,
                        items.len(),
                        depth
                    )))
                }
            },
            (segment, other) => {
                return Err(CoreError::AddressingError(format!(
                    "cannot apply {} to {} at depth {}",
                    segment,
                    describe(other),
                    depth
                )))
            }
        }
    }
    Ok(current.clone())
}

/// Walk `path` below `root` for writing, creating missing containers.
///
/// `null` turns into an empty object when a key is applied to it; a missing
/// key is inserted as `null`. Indices must address existing elements.
pub fn materialize<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        if matches!(segment, PathSegment::Key(_)) && current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => {
                map.entry(key.clone()).or_insert(Value::Null)
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                let len = items.len();
                items.get_mut(*index).ok_or_else(|| {
                    CoreError::AddressingError(format!(
                        "index {} out of range (len {}) at depth {}",
                        index, len, depth
                    ))
                })?
            }
            (segment, other) => {
                return Err(CoreError::AddressingError(format!(
                    "cannot apply {} to {} at depth {}",
                    segment,
                    describe(other),
                    depth
                )))
            }
        };
    }
    Ok(current)
}

/// Lossy conversions from a JSON value to host scalars and containers.
pub trait Coerce {
    /// Strings verbatim, `null` as `""`, everything else as JSON text.
    fn to_string_lossy(&self) -> String;

    /// Numbers truncate toward zero; numeric strings are parsed.
    fn to_i64(&self) -> Result<i64>;

    fn to_f64(&self) -> Result<f64>;

    /// `""`, `"0"`, `"false"` and `"False"` are false, as are `null` and zero.
    fn to_bool(&self) -> bool;

    /// Arrays clone their items; `null` is the empty list.
    fn to_list(&self) -> Result<Vec<Value>>;

    /// Objects clone their entries; `null` is the empty map.
    fn to_map(&self) -> Result<Map<String, Value>>;
}

fn conversion_error(value: &Value, target: &'static str) -> CoreError {
    CoreError::TypeConversion {
        value: value.to_string(),
        target,
    }
}

impl Coerce for Value {
    fn to_string_lossy(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn to_i64(&self) -> Result<i64> {
        match self {
            Value::Null => Ok(0),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|u| u as i64))
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| conversion_error(self, "integer")),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                    .map_err(|_| conversion_error(self, "integer"))
            }
            _ => Err(conversion_error(self, "integer")),
        }
    }

    fn to_f64(&self) -> Result<f64> {
        match self {
            Value::Null => Ok(0.0),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => n.as_f64().ok_or_else(|| conversion_error(self, "float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| conversion_error(self, "float")),
            _ => Err(conversion_error(self, "float")),
        }
    }

    fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !matches!(s.as_str(), "" | "0" | "false" | "False"),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    fn to_list(&self) -> Result<Vec<Value>> {
        match self {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items.clone()),
            _ => Err(conversion_error(self, "list")),
        }
    }

    fn to_map(&self) -> Result<Map<String, Value>> {
        match self {
            Value::Null => Ok(Map::new()),
            Value::Object(map) => Ok(map.clone()),
            _ => Err(conversion_error(self, "map")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[PathSegment]) -> Vec<PathSegment> {
        segments.to_vec()
    }

    #[test]
    fn test_resolve_missing_key_is_null() {
        let doc = json!({"a": {"b": 1}});
        let p = path(&["a".into(), "missing".into(), "deeper".into()]);
        assert_eq!(resolve(&doc, &p).unwrap(), Value::Null);
    }

    #[test]
    fn test_resolve_index_into_scalar_fails() {
        let doc = json!({"a": 3});
        let p = path(&["a".into(), 0usize.into()]);
        assert!(matches!(resolve(&doc, &p), Err(CoreError::AddressingError(_))));
    }

    #[test]
    fn test_resolve_index_out_of_range_fails() {
        let doc = json!([1, 2]);
        assert!(matches!(
            resolve(&doc, &[PathSegment::Index(2)]),
            Err(CoreError::AddressingError(_))
        ));
        assert_eq!(resolve(&doc, &[PathSegment::Index(1)]).unwrap(), json!(2));
    }

    #[test]
    fn test_materialize_creates_intermediate_objects() {
        let mut doc = Value::Null;
        let p = path(&["a".into(), "b".into(), "c".into()]);
        *materialize(&mut doc, &p).unwrap() = json!("deep");
        assert_eq!(doc, json!({"a": {"b": {"c": "deep"}}}));
    }

    #[test]
    fn test_materialize_through_array() {
        let mut doc = json!({"list": [{"x": 1}, {"x": 2}]});
        let p = path(&["list".into(), 1usize.into(), "y".into()]);
        *materialize(&mut doc, &p).unwrap() = json!(true);
        assert_eq!(doc, json!({"list": [{"x": 1}, {"x": 2, "y": true}]}));
    }

    #[test]
    fn test_materialize_key_into_string_fails() {
        let mut doc = json!({"a": "text"});
        let p = path(&["a".into(), "b".into()]);
        assert!(matches!(
            materialize(&mut doc, &p),
            Err(CoreError::AddressingError(_))
        ));
    }

    #[test]
    fn test_string_coercion() {
        assert_eq!(json!("abc").to_string_lossy(), "abc");
        assert_eq!(Value::Null.to_string_lossy(), "");
        assert_eq!(json!(12).to_string_lossy(), "12");
        assert_eq!(json!({"k": [1]}).to_string_lossy(), r#"{"k":[1]}"#);
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(json!("1.3").to_f64().unwrap(), 1.3);
        assert_eq!(json!("1.3").to_i64().unwrap(), 1);
        assert_eq!(json!(" 42 ").to_i64().unwrap(), 42);
        assert_eq!(json!(2.9).to_i64().unwrap(), 2);
        assert_eq!(json!(true).to_i64().unwrap(), 1);
        assert_eq!(Value::Null.to_f64().unwrap(), 0.0);
        assert!(matches!(
            json!("abc").to_i64(),
            Err(CoreError::TypeConversion { target: "integer", .. })
        ));
        assert!(json!("abc").to_f64().is_err());
        assert!(json!([1]).to_f64().is_err());
    }

    #[test]
    fn test_bool_coercion() {
        for falsy in [json!(""), json!("0"), json!("false"), json!("False"), json!(0), json!(null)] {
            assert!(!falsy.to_bool(), "{} should be false", falsy);
        }
        for truthy in [json!("no"), json!("1"), json!(0.5), json!(true), json!([])] {
            assert!(truthy.to_bool(), "{} should be true", truthy);
        }
    }

    #[test]
    fn test_container_coercion() {
        assert_eq!(json!([1, "a"]).to_list().unwrap().len(), 2);
        assert!(Value::Null.to_list().unwrap().is_empty());
        assert!(json!("x").to_list().is_err());
        assert_eq!(json!({"a": 1}).to_map().unwrap().len(), 1);
        assert!(json!(1).to_map().is_err());
    }
}
