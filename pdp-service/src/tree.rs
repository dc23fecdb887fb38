//! Dotted-path lookup over dynamic JSON trees
//!
//! Cached payloads are arbitrary JSON, modeled as `serde_json::Value`.
//! Paths are dot-separated: string segments index objects, numeric
//! segments index arrays. The empty path addresses the whole value and a
//! single `.` addresses the current object; an empty segment anywhere
//! else (`a..b`) is an error.

use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Look up a dotted path in a JSON tree
///
/// Returns `Ok(None)` when the path walks off the tree (missing key,
/// index out of range, scalar in the middle) and `Err` only for malformed
/// paths.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    if path.is_empty() || path == "." {
        return Ok(Some(value));
    }

    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(GatewayError::BadRequest(format!(
                "malformed path {path:?}: empty segment"
            )));
        }
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(items) => {
                let idx: usize = match segment.parse() {
                    Ok(i) => i,
                    Err(_) => return Ok(None),
                };
                match items.get(idx) {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

/// Look up a path and coerce the leaf to a string
///
/// Missing paths and non-string leaves yield the empty string; callers
/// treat absent scalar fields as empty.
pub fn lookup_string(value: &Value, path: &str) -> String {
    match lookup(value, path) {
        Ok(Some(Value::String(s))) => s.clone(),
        _ => String::new(),
    }
}

/// Collect the string items of an array at a path, skipping non-strings
pub fn lookup_strings(value: &Value, path: &str) -> Vec<String> {
    match lookup(value, path) {
        Ok(Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "urn:ngsi-ld:catalog:1",
            "relatedParty": [
                {"role": "Seller", "name": "did:elsi:A"},
                {"role": "Buyer", "name": "did:elsi:B"}
            ],
            "nested": {"a": {"b": 42}}
        })
    }

    #[test]
    fn test_empty_path_is_whole_value() {
        let v = sample();
        assert_eq!(lookup(&v, "").unwrap(), Some(&v));
        assert_eq!(lookup(&v, ".").unwrap(), Some(&v));
    }

    #[test]
    fn test_object_and_array_segments() {
        let v = sample();
        assert_eq!(
            lookup(&v, "relatedParty.1.name").unwrap(),
            Some(&json!("did:elsi:B"))
        );
        assert_eq!(lookup(&v, "nested.a.b").unwrap(), Some(&json!(42)));
    }

    #[test]
    fn test_missing_paths_are_none() {
        let v = sample();
        assert_eq!(lookup(&v, "nope").unwrap(), None);
        assert_eq!(lookup(&v, "relatedParty.7").unwrap(), None);
        assert_eq!(lookup(&v, "relatedParty.name").unwrap(), None);
        assert_eq!(lookup(&v, "id.deeper").unwrap(), None);
    }

    #[test]
    fn test_double_dot_is_error() {
        let v = sample();
        assert!(lookup(&v, "nested..a").is_err());
        assert!(lookup(&v, ".nested").is_err());
    }

    #[test]
    fn test_string_helpers() {
        let v = sample();
        assert_eq!(lookup_string(&v, "id"), "urn:ngsi-ld:catalog:1");
        assert_eq!(lookup_string(&v, "nested.a.b"), "");
        assert_eq!(lookup_string(&v, "missing"), "");
    }
}
