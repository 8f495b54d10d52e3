//! Minimal JSON-Schema-shaped validation and scalar coercion.
//!
//! Grounded in the teacher crate's `tools/structured_tool.rs` convention of
//! describing tool arguments as a plain `serde_json::Value` schema rather
//! than a full JSON-Schema-draft implementation. This core only needs the
//! two properties the spec calls for: "type coercion for scalars" when
//! validating tool arguments (§4.8.3), and detecting a structured-output
//! mismatch to trigger the repair turn (§4.8.4) -- not full schema
//! compliance.

use serde_json::Value;

use crate::error::CoreError;

fn declared_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(|t| t.as_str())
}

/// Coerce scalar leaves of `value` toward the types their schema declares
/// (string -> number/integer/boolean where the string parses cleanly).
/// Recurses into object properties and array items; leaves anything it
/// can't confidently coerce untouched.
pub fn coerce_scalars(value: &mut Value, schema: &Value) {
    match declared_type(schema) {
        Some("number") => {
            if let Some(s) = value.as_str() {
                if let Ok(n) = s.parse::<f64>() {
                    if let Some(num) = serde_json::Number::from_f64(n) {
                        *value = Value::Number(num);
                    }
                }
            }
        }
        Some("integer") => {
            if let Some(s) = value.as_str() {
                if let Ok(n) = s.parse::<i64>() {
                    *value = Value::Number(n.into());
                }
            }
        }
        Some("boolean") => {
            if let Some(s) = value.as_str() {
                match s.to_ascii_lowercase().as_str() {
                    "true" => *value = Value::Bool(true),
                    "false" => *value = Value::Bool(false),
                    _ => {}
                }
            }
        }
        Some("string") => {
            if !value.is_string() {
                *value = Value::String(value.to_string());
            }
        }
        Some("object") => {
            if let (Value::Object(map), Some(props)) = (value.clone(), schema.get("properties").and_then(|p| p.as_object())) {
                if let Value::Object(out) = value {
                    for (k, v) in out.iter_mut() {
                        if let Some(prop_schema) = props.get(k) {
                            coerce_scalars(v, prop_schema);
                        }
                    }
                }
                let _ = map;
            }
        }
        Some("array") => {
            if let (Value::Array(_), Some(items_schema)) = (value.clone(), schema.get("items")) {
                if let Value::Array(items) = value {
                    for item in items.iter_mut() {
                        coerce_scalars(item, items_schema);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Best-effort check that `value` matches the shape `schema` declares:
/// the top-level `type` (if present) and, for `object`, that every name in
/// `required` is present. Not a full validator -- sufficient to detect the
/// schema-mismatch cases the spec's repair-turn and tool-validation paths
/// need to catch.
pub fn matches_schema(value: &Value, schema: &Value) -> bool {
    match declared_type(schema) {
        Some("object") => {
            let Value::Object(map) = value else { return false };
            if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
                for name in required {
                    let Some(name) = name.as_str() else { continue };
                    if !map.contains_key(name) {
                        return false;
                    }
                }
            }
            true
        }
        Some("array") => value.is_array(),
        Some("string") => value.is_string(),
        Some("number") => value.is_number(),
        Some("integer") => value.is_i64() || value.is_u64(),
        Some("boolean") => value.is_boolean(),
        _ => true,
    }
}

/// Validate tool arguments against a tool's declared schema, coercing
/// scalars in place first (§4.8.3). Fails with `CoreError::Schema` if the
/// coerced value still doesn't match.
pub fn validate_tool_arguments(mut value: Value, schema: &Value) -> Result<Value, CoreError> {
    coerce_scalars(&mut value, schema);
    if matches_schema(&value, schema) {
        Ok(value)
    } else {
        Err(CoreError::Schema(format!(
            "tool arguments did not match declared schema: {value}"
        )))
    }
}
