//! Item extraction from raw tool output (§4.5 step 4) and the per-item
//! fields used for cursor comparison and event identity.

use serde_json::Value;

/// Well-known array shells probed in order before falling back to other
/// shapes (§4.5 step 4).
const ARRAY_SHELLS: &[&str] = &["data", "items", "files", "events", "tasks", "sleep"];

/// Candidate field names for an item's date/timestamp, checked in order.
const DATE_FIELDS: &[&str] = &[
    "day",
    "date",
    "timestamp",
    "ts",
    "created_at",
    "createdAt",
    "updated_at",
    "updatedAt",
    "due_date",
    "completed_at",
    "start_time",
];

/// Candidate field names for an item's natural identifier.
const ID_FIELDS: &[&str] = &["id", "task_id", "message_id", "ts", "event_id"];

/// §4.5 step 4: probe well-known array shells, a singleton `summary`
/// object, the output itself if already an array, or wrap a scalar as
/// `[{message: value}]`.
pub fn extract_items(raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            for shell in ARRAY_SHELLS {
                if let Some(Value::Array(items)) = map.get(*shell) {
                    return items.clone();
                }
            }
            if let Some(summary) = map.get("summary") {
                return vec![summary.clone()];
            }
            // No known shell and no summary wrapper: the object itself is
            // the one item the tool returned.
            vec![raw.clone()]
        }
        other => vec![serde_json::json!({"message": other})],
    }
}

/// The string form of an item's date/timestamp field, if any, for cursor
/// comparison (§4.5 step 5).
pub fn item_cursor_field(item: &Value) -> Option<String> {
    let obj = item.as_object()?;
    for field in DATE_FIELDS {
        if let Some(v) = obj.get(*field) {
            match v {
                Value::String(s) => return Some(s.clone()),
                Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Fallback "value signature" for items with no date field at all (§4.5
/// step 5, §9): presence/status/task/state heuristics, falling back to a
/// JSON dump of the item so two distinct undated items never collide.
pub fn value_signature(item: &Value) -> String {
    let obj = match item.as_object() {
        Some(o) => o,
        None => return serde_json::to_string(item).unwrap_or_default(),
    };

    if let Some(presence) = obj.get("presence").and_then(|v| v.as_str()) {
        return format!("presence:{presence}");
    }
    if obj.contains_key("status_text") || obj.contains_key("status_emoji") {
        let text = obj.get("status_text").and_then(|v| v.as_str()).unwrap_or("");
        let emoji = obj.get("status_emoji").and_then(|v| v.as_str()).unwrap_or("");
        return format!("status:{text}|{emoji}");
    }
    if let (Some(id), Some(completed)) = (obj.get("id"), obj.get("completed")) {
        return format!("task:{}:{}", crate::value::as_display_string(id), completed);
    }
    if let Some(state) = obj.get("state").and_then(|v| v.as_str()) {
        return format!("state:{state}");
    }
    if let Some(status) = obj.get("status").and_then(|v| v.as_str()) {
        return format!("status:{status}");
    }
    serde_json::to_string(item).unwrap_or_default()
}

/// An item's cursor value for filtering/advancing: its date field if
/// present, else its value signature.
pub fn item_cursor_value(item: &Value) -> String {
    item_cursor_field(item).unwrap_or_else(|| value_signature(item))
}

/// Best-effort natural identifier for per-item event ids (§3 Event,
/// §4.5 step 6 `per_item`).
pub fn item_identifier(item: &Value) -> Option<String> {
    let obj = item.as_object()?;
    for field in ID_FIELDS {
        if let Some(v) = obj.get(*field) {
            match v {
                Value::String(s) => return Some(s.clone()),
                Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}
