//! Runtime values of the policy language
//!
//! Values are immutable and cheaply clonable (`Arc` payloads), so workers
//! can move between threads. Host JSON trees are not deep-converted:
//! container nodes stay wrapped in [`Value::Json`] and unwrap lazily on
//! access, scalars become native values. Wrapped objects compare by their
//! `id` field when both sides carry one.

use serde_json::{Number, Value as Json};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::ast::Stmt;

/// A user-defined function: parameters and body, closed over the frozen
/// module globals at call time
#[derive(Debug, PartialEq)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Dict(Arc<BTreeMap<String, Value>>),
    /// Wrapped host tree node; always an array or an object
    Json(Arc<Json>),
    Func(Arc<FuncDef>),
    Builtin(&'static str),
    Module(&'static str),
    /// Bound method: receiver plus method name
    Method(Box<Value>, &'static str),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Arc::new(items))
    }

    /// Bridge a host JSON node into the value space
    pub fn from_json(node: &Json) -> Self {
        match node {
            Json::Null => Self::None,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Self::str(s),
            Json::Array(_) | Json::Object(_) => Self::Json(Arc::new(node.clone())),
        }
    }

    /// Bridge an owned host tree without cloning containers
    pub fn from_json_owned(node: Json) -> Self {
        match node {
            Json::Array(_) | Json::Object(_) => Self::Json(Arc::new(node)),
            scalar => Self::from_json(&scalar),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Json(j) => match j.as_ref() {
                Json::Array(_) => "list",
                _ => "dict",
            },
            Self::Func(_) => "function",
            Self::Builtin(_) | Self::Method(_, _) => "builtin_function",
            Self::Module(_) => "module",
        }
    }

    /// Python-shaped truthiness
    pub fn truth(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Float(x) => *x != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Dict(map) => !map.is_empty(),
            Self::Json(j) => match j.as_ref() {
                Json::Array(items) => !items.is_empty(),
                Json::Object(map) => !map.is_empty(),
                Json::Null => false,
                Json::Bool(b) => *b,
                Json::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                Json::String(s) => !s.is_empty(),
            },
            Self::Func(_) | Self::Builtin(_) | Self::Module(_) | Self::Method(_, _) => true,
        }
    }

    /// Length of a string or container, when it has one
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.chars().count()),
            Self::List(items) => Some(items.len()),
            Self::Dict(map) => Some(map.len()),
            Self::Json(j) => match j.as_ref() {
                Json::Array(items) => Some(items.len()),
                Json::Object(map) => Some(map.len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Convert back into a host JSON tree; callables have no JSON form
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Self::None => Some(Json::Null),
            Self::Bool(b) => Some(Json::Bool(*b)),
            Self::Int(n) => Some(Json::Number((*n).into())),
            Self::Float(x) => Number::from_f64(*x).map(Json::Number),
            Self::Str(s) => Some(Json::String(s.to_string())),
            Self::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(Json::Array),
            Self::Dict(map) => map
                .iter()
                .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Json::Object),
            Self::Json(j) => Some(j.as_ref().clone()),
            _ => None,
        }
    }
}

/// Equality across the value space
///
/// Numbers compare across int/float; wrapped host objects that both carry
/// a string `id` compare by id alone.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            *x as f64 == *y
        }
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((ka, va), (kb, vb))| {
                    ka == kb && values_equal(va, vb)
                })
        }
        (Value::Json(x), Value::Json(y)) => {
            match (object_id(x), object_id(y)) {
                (Some(ia), Some(ib)) => ia == ib,
                _ => x == y,
            }
        }
        (Value::Json(j), other) | (other, Value::Json(j)) => match other.to_json() {
            Some(converted) => j.as_ref() == &converted,
            None => false,
        },
        _ => false,
    }
}

/// Ordering for `<`, `<=`, `>`, `>=`; defined on numbers and strings only
pub fn values_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// The `id` field of a wrapped object, when present and a string
fn object_id(node: &Json) -> Option<&str> {
    node.as_object()?.get("id")?.as_str()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Func(func) => write!(f, "<function {}>", func.name),
            Self::Builtin(name) => write!(f, "<builtin {name}>"),
            Self::Method(_, name) => write!(f, "<method {name}>"),
            Self::Module(name) => write!(f, "<module {name}>"),
            other => match other.to_json() {
                Some(j) => write!(f, "{j}"),
                None => write!(f, "<{}>", other.type_name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.truth());
        assert!(!Value::Int(0).truth());
        assert!(Value::Int(-1).truth());
        assert!(!Value::str("").truth());
        assert!(Value::str("x").truth());
        assert!(!Value::list(vec![]).truth());
        assert!(!Value::from_json(&json!({})).truth());
        assert!(Value::from_json(&json!({"a": 1})).truth());
        assert!(!Value::from_json(&json!([])).truth());
    }

    #[test]
    fn test_scalars_unwrap_from_json() {
        assert!(matches!(Value::from_json(&json!(3)), Value::Int(3)));
        assert!(matches!(Value::from_json(&json!(true)), Value::Bool(true)));
        assert!(matches!(Value::from_json(&json!(null)), Value::None));
        assert!(matches!(Value::from_json(&json!("s")), Value::Str(_)));
        assert!(matches!(Value::from_json(&json!([1])), Value::Json(_)));
    }

    #[test]
    fn test_numeric_cross_equality() {
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0)));
        assert!(!values_equal(&Value::Int(2), &Value::Float(2.5)));
        assert!(!values_equal(&Value::Int(1), &Value::Bool(true)));
    }

    #[test]
    fn test_json_objects_compare_by_id() {
        let a = Value::from_json(&json!({"id": "urn:x:1", "name": "left"}));
        let b = Value::from_json(&json!({"id": "urn:x:1", "name": "right"}));
        let c = Value::from_json(&json!({"id": "urn:x:2", "name": "left"}));
        assert!(values_equal(&a, &b));
        assert!(!values_equal(&a, &c));

        // Without ids, comparison is structural.
        let d = Value::from_json(&json!({"name": "left"}));
        let e = Value::from_json(&json!({"name": "left"}));
        assert!(values_equal(&d, &e));
    }

    #[test]
    fn test_json_native_mixed_equality() {
        let wrapped = Value::from_json(&json!(["a", "b"]));
        let native = Value::list(vec![Value::str("a"), Value::str("b")]);
        assert!(values_equal(&wrapped, &native));
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            values_compare(&Value::Int(1), &Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            values_compare(&Value::str("a"), &Value::str("b")),
            Some(Ordering::Less)
        );
        assert_eq!(values_compare(&Value::str("a"), &Value::Int(1)), None);
    }

    #[test]
    fn test_len() {
        assert_eq!(Value::str("abc").len(), Some(3));
        assert_eq!(Value::from_json(&json!([1, 2])).len(), Some(2));
        assert_eq!(Value::Int(3).len(), None);
    }
}
