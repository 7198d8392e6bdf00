//! Template grammar (§4.1): `{{dotted.path}}` only — no control flow.
//!
//! A template that is *entirely* one `{{...}}` expression resolves to the
//! raw `Value` at that path (so an absent tool parameter can be passed
//! through as JSON `null` rather than the string `"null"`). A template with
//! surrounding text, or multiple expressions, is rendered by stringifying
//! each resolved value and splicing it into the larger string; an
//! unresolved path renders as the empty string there.

use serde_json::Value;
use tracing::debug;

use crate::error::TemplateError;
use crate::value::{as_display_string, get_path};

/// A single `{{...}}` occurrence and its surrounding literal text.
enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

/// Reject authoring of Handlebars-style control-flow blocks at construction
/// time (additive robustness from SPEC_FULL; not a runtime behavior change).
pub fn validate_no_control_flow(template: &str) -> Result<(), TemplateError> {
    for marker in ["{{#", "{{/"] {
        if template.contains(marker) {
            return Err(TemplateError::ControlFlowUnsupported(template.to_string()));
        }
    }
    Ok(())
}

fn split_segments(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                if !rest.is_empty() {
                    segments.push(Segment::Literal(rest));
                }
                break;
            }
            Some(start) => {
                if start > 0 {
                    segments.push(Segment::Literal(&rest[..start]));
                }
                let after_open = &rest[start + 2..];
                match after_open.find("}}") {
                    None => {
                        // Unterminated `{{` — treat the rest as a literal.
                        segments.push(Segment::Literal(&rest[start..]));
                        break;
                    }
                    Some(end) => {
                        segments.push(Segment::Expr(after_open[..end].trim()));
                        rest = &after_open[end + 2..];
                    }
                }
            }
        }
    }
    segments
}

/// Render a template string against a context value.
///
/// When `template` is a single whole-string `{{expr}}` (no surrounding
/// literal text), the raw resolved `Value` is returned — `Value::Null`
/// stands in for "undefined", signalling callers to omit the parameter
/// entirely rather than pass an empty string. Any other shape renders to
/// `Value::String`.
pub fn render(template: &str, ctx: &Value) -> Value {
    let segments = split_segments(template);

    if let [Segment::Expr(path)] = segments.as_slice() {
        return match get_path(ctx, path) {
            Some(v) => v.clone(),
            None => {
                debug!(%path, "template path unresolved — rendering as undefined");
                Value::Null
            }
        };
    }

    let mut out = String::new();
    for seg in &segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Expr(path) => match get_path(ctx, path) {
                Some(v) => out.push_str(&as_display_string(v)),
                None => {
                    debug!(%path, "template path unresolved — rendering as empty string");
                }
            },
        }
    }
    Value::String(out)
}

/// Recursively resolve a parameter tree (§4.2 step 2b): strings are
/// templated, maps/arrays are walked, everything else passes through.
pub fn render_value(template: &Value, ctx: &Value) -> Value {
    match template {
        Value::String(s) => render(s, ctx),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_value(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}
