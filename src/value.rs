//! Dynamic payload model (§9 design note: "dynamic typing of payloads").
//!
//! Tool outputs, trigger payloads, and the executor's context are all
//! free-form data. Rather than projecting them into statically typed
//! records, everything routes through `serde_json::Value` plus a dotted-path
//! accessor that understands numeric array indices and the `-1` "last
//! element" convention used throughout templates and conditions.

use serde_json::Value;

/// Split a dotted path into segments, e.g. `"user.name"` -> `["user", "name"]`,
/// `"items.-1.id"` -> `["items", "-1", "id"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Resolve a dotted path against a JSON value. Array segments are numeric
/// (`0`, `1`, ...) or `-1` for the last element. Returns `None` when any
/// segment fails to resolve (mirrors "undefined" in the spec's vocabulary).
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = split_path(path);
    get_path_segments(root, &segments)
}

fn get_path_segments<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(arr) => {
                let idx = resolve_index(seg, arr.len())?;
                arr.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// `-1` means "last element"; any other value must parse as a non-negative
/// index within bounds.
fn resolve_index(seg: &str, len: usize) -> Option<usize> {
    if seg == "-1" {
        return if len == 0 { None } else { Some(len - 1) };
    }
    let idx: i64 = seg.parse().ok()?;
    if idx < 0 || idx as usize >= len {
        return None;
    }
    Some(idx as usize)
}

/// True when `path` resolves to something other than `Value::Null` /
/// absent. Spec: "`exists`/`not_exists` treat `null` and `undefined` as
/// non-existent."
pub fn path_exists(root: &Value, path: &str) -> bool {
    !matches!(get_path(root, path), None | Some(Value::Null))
}

/// Coerce a JSON value to `f64` for numeric condition operators. Spec:
/// "parse failure yields `false`" at the condition layer — this returns
/// `None` and lets the caller decide the failure value.
pub fn as_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Stringify a value the way string condition operators and template
/// interpolation do: scalars render plainly, everything else as JSON.
pub fn as_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
