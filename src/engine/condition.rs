//! Condition evaluation (§4.1, §3 "Condition").
//!
//! Never throws: an unresolvable path or a bad operator degrades to `false`
//! (§4.1 "Failure mode", §7 "Unknown condition path").

use serde_json::Value;
use tracing::{debug, warn};

use crate::automations::model::{Condition, ConditionOp, GroupOperator};
use crate::value::{as_display_string, as_numeric, get_path, path_exists};

/// Evaluate a `trigger_config.filter`/`filter` JSON value that wasn't
/// authored as a validated `Action.condition` — the webhook automation-side
/// filter (§4.4 step 7) and the poller's per-item/raw filter (§4.5 step 6)
/// both read filters straight off a trigger config. Absent filter ⟺ always
/// admit (§8 "Filter pass-through law"); a filter that fails to parse (e.g.
/// an operator string outside `ConditionOp`) is treated the same as an
/// unknown operator (§7): logged and passed through as `true`.
pub fn evaluate_raw_filter(filter: Option<&Value>, ctx: &Value) -> bool {
    let filter = match filter {
        None => return true,
        Some(Value::Null) => return true,
        Some(v) => v,
    };
    match serde_json::from_value::<Condition>(filter.clone()) {
        Ok(condition) => evaluate(&condition, ctx),
        Err(e) => {
            warn!(error = %e, "unparseable filter — passing through");
            true
        }
    }
}

/// Resolve `path` against `ctx`, additionally trying it with/without a
/// `trigger_data.` prefix (§4.1 "Path resolution for conditions
/// additionally tries the path prefixed and un-prefixed...").
fn resolve<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = get_path(ctx, path) {
        return Some(v);
    }
    if let Some(stripped) = path.strip_prefix("trigger_data.") {
        if let Some(v) = get_path(ctx, stripped) {
            return Some(v);
        }
    } else {
        let prefixed = format!("trigger_data.{path}");
        if let Some(v) = get_path(ctx, &prefixed) {
            return Some(v);
        }
    }
    None
}

fn path_exists_tolerant(ctx: &Value, path: &str) -> bool {
    if path_exists(ctx, path) {
        return true;
    }
    if let Some(stripped) = path.strip_prefix("trigger_data.") {
        path_exists(ctx, stripped)
    } else {
        path_exists(ctx, &format!("trigger_data.{path}"))
    }
}

pub fn evaluate(condition: &Condition, ctx: &Value) -> bool {
    match condition {
        Condition::Group { operator, clauses } => evaluate_group(*operator, clauses, ctx),
        Condition::Clause {
            path,
            op,
            value,
            case_insensitive,
        } => evaluate_clause(path, *op, value, case_insensitive.unwrap_or(true), ctx),
    }
}

fn evaluate_group(operator: GroupOperator, clauses: &[Condition], ctx: &Value) -> bool {
    match operator {
        GroupOperator::And => {
            for clause in clauses {
                if !evaluate(clause, ctx) {
                    return false;
                }
            }
            true
        }
        GroupOperator::Or => {
            for clause in clauses {
                if evaluate(clause, ctx) {
                    return true;
                }
            }
            false
        }
    }
}

fn evaluate_clause(
    path: &str,
    op: ConditionOp,
    expected: &Value,
    case_insensitive: bool,
    ctx: &Value,
) -> bool {
    if op.is_existence() {
        let exists = path_exists_tolerant(ctx, path);
        return match op {
            ConditionOp::Exists => exists,
            ConditionOp::NotExists => !exists,
            _ => unreachable!(),
        };
    }

    let actual = match resolve(ctx, path) {
        Some(v) => v,
        None => {
            debug!(%path, "condition path unresolved — evaluating to false");
            return false;
        }
    };

    if op.is_numeric() {
        return evaluate_numeric(op, actual, expected);
    }

    evaluate_string_op(op, actual, expected, case_insensitive)
}

fn evaluate_numeric(op: ConditionOp, actual: &Value, expected: &Value) -> bool {
    let (a, b) = match (as_numeric(actual), as_numeric(expected)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    match op {
        ConditionOp::Lt => a < b,
        ConditionOp::Gt => a > b,
        ConditionOp::Lte => a <= b,
        ConditionOp::Gte => a >= b,
        ConditionOp::Eq => a == b,
        ConditionOp::Neq => a != b,
        _ => false,
    }
}

fn evaluate_string_op(
    op: ConditionOp,
    actual: &Value,
    expected: &Value,
    case_insensitive: bool,
) -> bool {
    let normalize = |s: String| if case_insensitive { s.to_lowercase() } else { s };
    let actual_s = normalize(as_display_string(actual));

    match op {
        ConditionOp::Eq => actual_s == normalize(as_display_string(expected)),
        ConditionOp::Neq => actual_s != normalize(as_display_string(expected)),
        ConditionOp::Contains => actual_s.contains(&normalize(as_display_string(expected))),
        ConditionOp::NotContains => !actual_s.contains(&normalize(as_display_string(expected))),
        ConditionOp::StartsWith => actual_s.starts_with(&normalize(as_display_string(expected))),
        ConditionOp::EndsWith => actual_s.ends_with(&normalize(as_display_string(expected))),
        ConditionOp::ContainsAny => match expected {
            Value::Array(candidates) => candidates
                .iter()
                .any(|c| actual_s.contains(&normalize(as_display_string(c)))),
            other => actual_s.contains(&normalize(as_display_string(other))),
        },
        ConditionOp::Exists | ConditionOp::NotExists => unreachable!("handled above"),
        ConditionOp::Lt
        | ConditionOp::Gt
        | ConditionOp::Lte
        | ConditionOp::Gte => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clause(path: &str, op: ConditionOp, value: Value) -> Condition {
        Condition::Clause {
            path: path.to_string(),
            op,
            value,
            case_insensitive: None,
        }
    }

    #[test]
    fn absent_filter_behavior_is_handled_by_caller_not_here() {
        // Filter pass-through law lives at the webhook/poller layer — see
        // webhook::handlers and poller tests. This module only evaluates a
        // Condition that is actually present.
    }

    #[test]
    fn numeric_lt_compares_across_string_and_number() {
        let ctx = json!({"score": "65"});
        assert!(evaluate(&clause("score", ConditionOp::Lt, json!(70)), &ctx));
    }

    #[test]
    fn numeric_parse_failure_yields_false() {
        let ctx = json!({"score": "not-a-number"});
        assert!(!evaluate(&clause("score", ConditionOp::Lt, json!(70)), &ctx));
    }

    #[test]
    fn string_contains_is_case_insensitive_by_default() {
        let ctx = json!({"subject": "URGENT: please reply"});
        assert!(evaluate(
            &clause("subject", ConditionOp::Contains, json!("urgent")),
            &ctx
        ));
    }

    #[test]
    fn case_insensitive_false_overrides_default() {
        let ctx = json!({"subject": "URGENT"});
        let c = Condition::Clause {
            path: "subject".to_string(),
            op: ConditionOp::Contains,
            value: json!("urgent"),
            case_insensitive: Some(false),
        };
        assert!(!evaluate(&c, &ctx));
    }

    #[test]
    fn exists_treats_null_as_absent() {
        let ctx = json!({"a": null});
        assert!(!evaluate(&clause("a", ConditionOp::Exists, Value::Null), &ctx));
        assert!(evaluate(&clause("a", ConditionOp::NotExists, Value::Null), &ctx));
    }

    #[test]
    fn unresolvable_path_degrades_to_false() {
        let ctx = json!({});
        assert!(!evaluate(&clause("nope", ConditionOp::Eq, json!("x")), &ctx));
    }

    #[test]
    fn trigger_data_prefix_tolerance() {
        let ctx = json!({"trigger_data": {"subject": "hi"}, "subject": "hi"});
        assert!(evaluate(
            &clause("trigger_data.subject", ConditionOp::Eq, json!("hi")),
            &ctx
        ));
        assert!(evaluate(&clause("subject", ConditionOp::Eq, json!("hi")), &ctx));
    }

    #[test]
    fn condition_negation_law_for_eq_and_neq() {
        let ctx = json!({"a": 5});
        let eq = clause("a", ConditionOp::Eq, json!(5));
        let neq = clause("a", ConditionOp::Neq, json!(5));
        assert_ne!(evaluate(&eq, &ctx), evaluate(&neq, &ctx));
    }

    #[test]
    fn group_or_short_circuits_on_first_match() {
        let ctx = json!({"subject": "Urgent: please reply"});
        let group = Condition::Group {
            operator: GroupOperator::Or,
            clauses: vec![
                clause("subject", ConditionOp::Contains, json!("urgent")),
                clause("subject", ConditionOp::Contains, json!("asap")),
            ],
        };
        assert!(evaluate(&group, &ctx));
    }

    #[test]
    fn group_and_requires_all_clauses() {
        let ctx = json!({"subject": "Urgent", "from": "boss@example.com"});
        let group = Condition::Group {
            operator: GroupOperator::And,
            clauses: vec![
                clause("subject", ConditionOp::Contains, json!("urgent")),
                clause("from", ConditionOp::EndsWith, json!("example.org")),
            ],
        };
        assert!(!evaluate(&group, &ctx));
    }

    #[test]
    fn contains_any_matches_array_of_candidates() {
        let ctx = json!({"subject": "please reply ASAP"});
        assert!(evaluate(
            &clause(
                "subject",
                ConditionOp::ContainsAny,
                json!(["urgent", "asap"])
            ),
            &ctx
        ));
    }

    #[test]
    fn raw_filter_absent_always_admits() {
        assert!(evaluate_raw_filter(None, &json!({})));
    }

    #[test]
    fn raw_filter_unparseable_operator_passes_through() {
        let filter = json!({"path": "x", "op": "~weird~", "value": 1});
        assert!(evaluate_raw_filter(Some(&filter), &json!({"x": 1})));
    }

    #[test]
    fn raw_filter_applies_when_well_formed() {
        let filter = json!({"path": "score", "op": "<", "value": 70});
        assert!(evaluate_raw_filter(Some(&filter), &json!({"score": 65})));
        assert!(!evaluate_raw_filter(Some(&filter), &json!({"score": 80})));
    }
}
