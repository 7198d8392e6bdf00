//! Aggregation modes (§4.5 step 6): how a poll's new-item set becomes the
//! events handed to the event queue.

use serde_json::{json, Map, Value};

use crate::engine::evaluate_raw_filter;
use crate::value::as_numeric;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    PerItem,
    Batch,
    Summary,
    Latest,
}

impl AggregationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per_item" => Some(Self::PerItem),
            "batch" => Some(Self::Batch),
            "summary" => Some(Self::Summary),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }
}

/// Filter context an item (or, for `latest`, the raw tool output) is
/// evaluated against — mirrors the webhook automation filter's
/// `{trigger_data: payload}` wrapping (§4.4 step 7) so author-written
/// filters behave identically whether triggered by a webhook or a poll.
fn filter_ctx(payload: &Value) -> Value {
    json!({"trigger_data": payload})
}

pub fn passes_filter(filter: Option<&Value>, payload: &Value) -> bool {
    evaluate_raw_filter(filter, &filter_ctx(payload))
}

/// One event-to-be-enqueued: the payload plus the event identifier the
/// poller should dedup on.
pub struct AggregatedEvent {
    pub event_id: String,
    pub payload: Value,
}

/// `per_item`: one event per new item that passes the filter, payload
/// merged with `{type, automation_id}` (§4.5 step 6).
pub fn per_item(
    items: &[Value],
    filter: Option<&Value>,
    event_type: &str,
    automation_id: &str,
    synthesize_id: impl Fn(&Value) -> String,
) -> Vec<AggregatedEvent> {
    items
        .iter()
        .filter(|item| passes_filter(filter, item))
        .map(|item| {
            let mut payload = match item {
                Value::Object(map) => map.clone(),
                other => {
                    let mut m = Map::new();
                    m.insert("value".to_string(), other.clone());
                    m
                }
            };
            payload.insert("type".to_string(), json!(event_type));
            payload.insert("automation_id".to_string(), json!(automation_id));
            AggregatedEvent {
                event_id: synthesize_id(item),
                payload: Value::Object(payload),
            }
        })
        .collect()
}

/// `batch`: a single event bundling every item that passes the filter, or
/// no event at all if none survive.
pub fn batch(items: &[Value], filter: Option<&Value>, event_id: String) -> Option<AggregatedEvent> {
    let surviving: Vec<Value> = items
        .iter()
        .filter(|item| passes_filter(filter, item))
        .cloned()
        .collect();
    if surviving.is_empty() {
        return None;
    }
    let count = surviving.len();
    Some(AggregatedEvent {
        event_id,
        payload: json!({"items": surviving, "count": count, "_aggregation": "batch"}),
    })
}

/// `summary`: min/max/avg across every numeric field present on the first
/// surviving item, plus the latest item's raw value (§4.5 step 6).
pub fn summary(items: &[Value], filter: Option<&Value>, event_id: String) -> Option<AggregatedEvent> {
    let surviving: Vec<Value> = items
        .iter()
        .filter(|item| passes_filter(filter, item))
        .cloned()
        .collect();
    let first = surviving.first()?;
    let numeric_fields: Vec<&str> = first
        .as_object()
        .map(|m| {
            m.iter()
                .filter(|(_, v)| matches!(v, Value::Number(_)))
                .map(|(k, _)| k.as_str())
                .collect()
        })
        .unwrap_or_default();

    let mut stats = Map::new();
    for field in &numeric_fields {
        let values: Vec<f64> = surviving
            .iter()
            .filter_map(|item| item.get(*field).and_then(as_numeric))
            .collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        stats.insert(format!("{field}_min"), json!(min));
        stats.insert(format!("{field}_max"), json!(max));
        stats.insert(format!("{field}_avg"), json!(avg));
    }
    stats.insert("latest".to_string(), surviving.last().cloned().unwrap_or(Value::Null));
    stats.insert("_aggregation".to_string(), json!("summary"));
    Some(AggregatedEvent {
        event_id,
        payload: Value::Object(stats),
    })
}

/// `latest` (health default): filter the *raw* tool output, not the
/// extracted item, so author filters still match the tool's documented
/// return schema. Array outputs stay arrays; primitives become
/// `{type, message}` (§4.5 step 6).
pub fn latest(raw: &Value, filter: Option<&Value>, event_id: String) -> Option<AggregatedEvent> {
    if !passes_filter(filter, raw) {
        return None;
    }
    let payload = match raw {
        Value::Array(_) => raw.clone(),
        Value::Object(_) => raw.clone(),
        other => json!({"type": "value", "message": other}),
    };
    Some(AggregatedEvent { event_id, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_merges_type_and_automation_id() {
        let items = vec![json!({"id": "1", "score": 65})];
        let events = per_item(&items, None, "oura.sleep", "auto-1", |_| "evt-1".to_string());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["type"], json!("oura.sleep"));
        assert_eq!(events[0].payload["automation_id"], json!("auto-1"));
        assert_eq!(events[0].payload["score"], json!(65));
    }

    #[test]
    fn per_item_filters_before_emitting() {
        let items = vec![json!({"score": 65}), json!({"score": 90})];
        let filter = json!({"path": "score", "op": "<", "value": 70});
        let events = per_item(&items, Some(&filter), "t", "a", |_| "id".to_string());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["score"], json!(65));
    }

    #[test]
    fn batch_bundles_surviving_items_into_one_event() {
        let items = vec![json!({"score": 65}), json!({"score": 90})];
        let filter = json!({"path": "score", "op": "<", "value": 70});
        let event = batch(&items, Some(&filter), "evt".to_string()).unwrap();
        assert_eq!(event.payload["count"], json!(1));
    }

    #[test]
    fn batch_emits_nothing_when_all_filtered_out() {
        let items = vec![json!({"score": 90})];
        let filter = json!({"path": "score", "op": "<", "value": 70});
        assert!(batch(&items, Some(&filter), "evt".to_string()).is_none());
    }

    #[test]
    fn summary_computes_min_max_avg_across_survivors() {
        let items = vec![json!({"score": 60}), json!({"score": 80})];
        let event = summary(&items, None, "evt".to_string()).unwrap();
        assert_eq!(event.payload["score_min"], json!(60.0));
        assert_eq!(event.payload["score_max"], json!(80.0));
        assert_eq!(event.payload["score_avg"], json!(70.0));
    }

    #[test]
    fn latest_preserves_array_shape_instead_of_spreading_into_object() {
        let raw = json!([{"day": "2025-02-27", "score": 65}]);
        let event = latest(&raw, None, "evt".to_string()).unwrap();
        assert!(event.payload.is_array());
    }

    #[test]
    fn latest_filters_against_raw_output_not_extracted_item() {
        let raw = json!({"data": [{"score": 65}]});
        let filter = json!({"path": "data.0.score", "op": "<", "value": 70});
        assert!(latest(&raw, Some(&filter), "evt".to_string()).is_some());
    }
}
