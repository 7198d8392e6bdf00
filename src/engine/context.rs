//! Execution context (§4.1 "Context layout").
//!
//! A single JSON object assembled from, in low-to-high precedence order:
//! trigger_data spread at the root, the reserved `user`/`trigger_data` keys,
//! `output_as` bindings accumulated as actions run, user-defined variables,
//! and the built-in date/time variables. Template resolution and condition
//! evaluation both read from this same object via `value::get_path`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// `user` sub-object (§4.1).
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub id: String,
    pub email: Option<String>,
    pub timezone: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl UserInfo {
    fn to_value(&self) -> Value {
        Value::Object(
            [
                ("id".to_string(), Value::String(self.id.clone())),
                (
                    "email".to_string(),
                    self.email.clone().map(Value::String).unwrap_or(Value::Null),
                ),
                (
                    "timezone".to_string(),
                    self.timezone
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                ),
                (
                    "name".to_string(),
                    self.name.clone().map(Value::String).unwrap_or(Value::Null),
                ),
                (
                    "phone".to_string(),
                    self.phone.clone().map(Value::String).unwrap_or(Value::Null),
                ),
            ]
            .into_iter()
            .collect(),
        )
    }

    /// Resolve the user's timezone, falling back to UTC when unset or
    /// unparseable (§4.1 "Built-in variables").
    fn resolved_tz(&self) -> Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

/// The executor's context object. Built once per execution, then mutated as
/// `output_as` bindings accumulate (§4.2 step 2g).
#[derive(Debug, Clone)]
pub struct Context {
    root: Map<String, Value>,
}

impl Context {
    /// Build the initial context for an execution (§4.1).
    pub fn build(
        trigger_data: &Value,
        user: &UserInfo,
        variables: &HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut root = Map::new();

        // (a) trigger_data spread at the root.
        if let Value::Object(map) = trigger_data {
            for (k, v) in map {
                root.insert(k.clone(), v.clone());
            }
        }

        // (e) user-defined variables (lower precedence than reserved keys,
        // applied before them so `user`/`trigger_data` can't be clobbered).
        for (k, v) in variables {
            root.insert(k.clone(), v.clone());
        }

        // (b)/(c) reserved keys always win.
        root.insert("user".to_string(), user.to_value());
        root.insert("trigger_data".to_string(), trigger_data.clone());

        let mut ctx = Self { root };
        ctx.install_builtin_datetimes(user, now);
        ctx
    }

    /// (d) bind an action's raw return under `output_as`.
    pub fn bind_output(&mut self, name: &str, value: Value) {
        self.root.insert(name.to_string(), value);
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    fn install_builtin_datetimes(&mut self, user: &UserInfo, now: DateTime<Utc>) {
        let tz = user.resolved_tz();
        let local_now = now.with_timezone(&tz);
        let local_today = local_now.date_naive();

        let iso_date = |d: chrono::NaiveDate| d.format("%Y-%m-%d").to_string();

        self.root
            .insert("today".into(), Value::String(iso_date(local_today)));
        self.root.insert(
            "yesterday".into(),
            Value::String(iso_date(local_today - Duration::days(1))),
        );
        self.root.insert(
            "tomorrow".into(),
            Value::String(iso_date(local_today + Duration::days(1))),
        );
        self.root.insert(
            "two_days_ago".into(),
            Value::String(iso_date(local_today - Duration::days(2))),
        );

        let weekday_num = local_today.weekday().num_days_from_monday() as i64;
        let week_start = local_today - Duration::days(weekday_num);
        let week_end = week_start + Duration::days(6);
        self.root
            .insert("this_week_start".into(), Value::String(iso_date(week_start)));
        self.root
            .insert("this_week_end".into(), Value::String(iso_date(week_end)));

        self.root
            .insert("now".into(), Value::String(now.to_rfc3339()));
        for hours in [1, 6, 12, 24] {
            self.root.insert(
                format!("now_minus_{hours}h"),
                Value::String((now - Duration::hours(hours)).to_rfc3339()),
            );
        }

        let utc_today = now.date_naive();
        self.root
            .insert("today_utc".into(), Value::String(iso_date(utc_today)));
        self.root.insert(
            "yesterday_utc".into(),
            Value::String(iso_date(utc_today - Duration::days(1))),
        );
        self.root.insert(
            "tomorrow_utc".into(),
            Value::String(iso_date(utc_today + Duration::days(1))),
        );
    }
}

/// Parse a user timezone string, used by the poller/scheduler when they need
/// a `Tz` outside of a full `Context` (e.g. the scheduler's time-of-day gate
/// with an explicit `trigger_config.timezone`).
pub fn parse_tz(tz: Option<&str>) -> Tz {
    tz.and_then(|s| s.parse::<Tz>().ok()).unwrap_or(chrono_tz::UTC)
}

#[allow(dead_code)]
fn _unused_timezone_constructor_marker(tz: Tz, y: i32, m: u32, d: u32) -> Option<DateTime<Tz>> {
    // Keeps `TimeZone` import alive for downstream modules that construct
    // zoned datetimes from y/m/d without pulling in the trait themselves.
    tz.with_ymd_and_hms(y, m, d, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_data_spreads_at_root_and_is_also_nested() {
        let ctx = Context::build(
            &json!({"subject": "hello"}),
            &UserInfo::default(),
            &HashMap::new(),
            Utc::now(),
        );
        let v = ctx.as_value();
        assert_eq!(v["subject"], json!("hello"));
        assert_eq!(v["trigger_data"]["subject"], json!("hello"));
    }

    #[test]
    fn reserved_keys_win_over_variables() {
        let mut vars = HashMap::new();
        vars.insert("user".to_string(), json!("clobber-attempt"));
        let ctx = Context::build(&json!({}), &UserInfo::default(), &vars, Utc::now());
        assert!(ctx.as_value()["user"].is_object());
    }

    #[test]
    fn output_as_binds_into_root() {
        let mut ctx = Context::build(&json!({}), &UserInfo::default(), &HashMap::new(), Utc::now());
        ctx.bind_output("weather", json!({"temp": 72}));
        assert_eq!(ctx.as_value()["weather"]["temp"], json!(72));
    }

    #[test]
    fn builtin_datetimes_present() {
        let ctx = Context::build(&json!({}), &UserInfo::default(), &HashMap::new(), Utc::now());
        let v = ctx.as_value();
        for key in ["today", "yesterday", "tomorrow", "this_week_start", "this_week_end", "now"] {
            assert!(v.get(key).is_some(), "missing built-in variable {key}");
        }
    }
}
