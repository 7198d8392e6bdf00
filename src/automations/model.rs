//! Automation record, action list, and condition grammar (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Lifecycle state. `Active` is the only state the scheduler/poller/webhook
/// dispatcher will select for execution (invariant 3: "An automation whose
/// `active=false` is never executed").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    PendingReview,
    Active,
    Paused,
    Disabled,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationStatus::PendingReview => "pending_review",
            AutomationStatus::Active => "active",
            AutomationStatus::Paused => "paused",
            AutomationStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(AutomationStatus::PendingReview),
            "active" => Some(AutomationStatus::Active),
            "paused" => Some(AutomationStatus::Paused),
            "disabled" => Some(AutomationStatus::Disabled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AutomationStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Polling,
    ScheduleOnce,
    ScheduleRecurring,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::Polling => "polling",
            TriggerType::ScheduleOnce => "schedule_once",
            TriggerType::ScheduleRecurring => "schedule_recurring",
            TriggerType::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(TriggerType::Webhook),
            "polling" => Ok(TriggerType::Polling),
            "schedule_once" => Ok(TriggerType::ScheduleOnce),
            "schedule_recurring" => Ok(TriggerType::ScheduleRecurring),
            "manual" => Ok(TriggerType::Manual),
            // Legacy compatibility shim (§9 Open Question 3): execution logs
            // from before the once/recurring split used the bare "schedule"
            // trigger type. Accept it on read, never written on new records.
            "schedule" => Ok(TriggerType::ScheduleRecurring),
            other => Err(EngineError::UnknownTriggerType(other.to_string())),
        }
    }
}

/// The authored automation record — the single source of truth for all
/// runtime dispatch decisions (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: AutomationStatus,
    pub trigger_type: TriggerType,
    /// Trigger-type-dependent structured object (§6 shapes).
    pub trigger_config: Value,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Polling state — only meaningful for `trigger_type = polling`.
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_poll_cursor: Option<String>,
    pub polling_interval_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRecord {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// One step in an automation's action list (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Value,
    /// Context key the tool's raw return is bound under, if any. Spec
    /// invariant 4: must not collide with `user`/`trigger_data`.
    #[serde(default)]
    pub output_as: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Per-invocation timeout override; defaults to the engine-wide 30s.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Reserved context keys that `output_as` must never shadow (invariant 4).
pub const RESERVED_CONTEXT_KEYS: &[&str] = &["user", "trigger_data"];

impl Action {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.output_as {
            if RESERVED_CONTEXT_KEYS.contains(&name.as_str()) {
                return Err(EngineError::InvalidTriggerConfig {
                    automation_id: String::new(),
                    reason: format!("output_as '{name}' collides with a reserved context key"),
                });
            }
        }
        Ok(())
    }
}

/// A condition clause or recursive group (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group {
        operator: GroupOperator,
        clauses: Vec<Condition>,
    },
    Clause {
        path: String,
        op: ConditionOp,
        #[serde(default)]
        value: Value,
        /// String operators are case-insensitive unless this is `Some(false)`.
        #[serde(default)]
        case_insensitive: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    Contains,
    ContainsAny,
    NotContains,
    StartsWith,
    EndsWith,
    Exists,
    NotExists,
}

impl ConditionOp {
    /// Flip `==`/`!=` for the negation law in §8. Other operators have no
    /// well-defined flip and return `None`.
    pub fn flipped(&self) -> Option<ConditionOp> {
        match self {
            ConditionOp::Eq => Some(ConditionOp::Neq),
            ConditionOp::Neq => Some(ConditionOp::Eq),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ConditionOp::Lt | ConditionOp::Gt | ConditionOp::Lte | ConditionOp::Gte
        )
    }

    pub fn is_existence(&self) -> bool {
        matches!(self, ConditionOp::Exists | ConditionOp::NotExists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_type_accepts_legacy_schedule_spelling() {
        assert_eq!(
            TriggerType::from_str("schedule").unwrap(),
            TriggerType::ScheduleRecurring
        );
    }

    #[test]
    fn trigger_type_rejects_unknown() {
        assert!(TriggerType::from_str("carrier_pigeon").is_err());
    }

    #[test]
    fn eq_and_neq_are_flips_of_each_other() {
        assert_eq!(ConditionOp::Eq.flipped(), Some(ConditionOp::Neq));
        assert_eq!(ConditionOp::Neq.flipped(), Some(ConditionOp::Eq));
        assert_eq!(ConditionOp::Contains.flipped(), None);
    }

    #[test]
    fn output_as_rejects_reserved_keys() {
        let action = Action {
            id: "a1".into(),
            tool: "noop".into(),
            parameters: Value::Null,
            output_as: Some("trigger_data".into()),
            condition: None,
            timeout_secs: None,
        };
        assert!(action.validate().is_err());
    }
}
