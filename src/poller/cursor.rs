//! Cursor comparison (§4.5 step 5, §9 "Cursor polymorphism").
//!
//! A cursor is an opaque string with three date/time interpretations plus a
//! structured "value signature" fallback for items that carry no date at
//! all. Comparison dispatches on syntactic shape; a shape mismatch between
//! the new and old cursor admits the item by default rather than risk
//! silently dropping it.

use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Iso(String),
    Numeric(f64),
    Rfc2822(i64),
    Signature(String),
}

fn classify(raw: &str) -> Shape {
    if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
        return Shape::Iso(raw.to_string());
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Shape::Numeric(n);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
        return Shape::Rfc2822(dt.timestamp());
    }
    Shape::Signature(raw.to_string())
}

/// True when `candidate` should be admitted as "new" relative to
/// `last_cursor`. `None` (no prior cursor) always admits.
pub fn is_newer(candidate: &str, last_cursor: Option<&str>) -> bool {
    let last = match last_cursor {
        None => return true,
        Some(l) => l,
    };

    match (classify(candidate), classify(last)) {
        (Shape::Iso(a), Shape::Iso(b)) => a > b,
        (Shape::Numeric(a), Shape::Numeric(b)) => a > b,
        (Shape::Rfc2822(a), Shape::Rfc2822(b)) => a > b,
        (Shape::Signature(a), Shape::Signature(b)) => a != b,
        // Shape mismatch (e.g. a service migrating from date-based to
        // timestamp-based polling) — admit rather than silently drop.
        _ => true,
    }
}

/// The more-recent of two cursors by the mode-appropriate comparator,
/// used to advance `last_poll_cursor` after a successful poll.
pub fn max_cursor<'a>(a: &'a str, b: &'a str) -> &'a str {
    if is_newer(b, Some(a)) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_dates_compare_lexicographically() {
        assert!(is_newer("2025-03-01", Some("2025-02-27")));
        assert!(!is_newer("2025-02-20", Some("2025-02-27")));
    }

    #[test]
    fn numeric_timestamps_compare_as_floats() {
        assert!(is_newer("1700000010.5", Some("1700000001.2")));
        assert!(!is_newer("1700000001.1", Some("1700000001.2")));
    }

    #[test]
    fn rfc2822_is_parsed_before_comparison_not_compared_lexicographically() {
        // "Mon" sorts after "Fri" lexicographically but is the earlier day
        // of a week that wrapped months — epoch comparison gets this right.
        let mon = "Mon, 03 Mar 2025 09:00:00 +0000";
        let fri = "Fri, 28 Feb 2025 09:00:00 +0000";
        assert!(is_newer(mon, Some(fri)));
    }

    #[test]
    fn no_prior_cursor_always_admits() {
        assert!(is_newer("2025-01-01", None));
    }

    #[test]
    fn signature_fallback_admits_only_on_difference() {
        assert!(is_newer("status:away", Some("status:active")));
        assert!(!is_newer("status:away", Some("status:away")));
    }

    #[test]
    fn shape_mismatch_admits_by_default() {
        assert!(is_newer("1700000000", Some("2025-02-27")));
    }

    #[test]
    fn max_cursor_picks_the_later_one() {
        assert_eq!(max_cursor("2025-02-20", "2025-02-27"), "2025-02-27");
        assert_eq!(max_cursor("2025-02-27", "2025-02-20"), "2025-02-27");
    }
}
