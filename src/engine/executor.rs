//! Action Executor (C2, §4.2): walks an automation's action list, builds
//! context, dispatches tools.
//!
//! Tool failures, timeouts, and the usage-limit sentinel are *data* here —
//! never `Err`. `Result` failures are reserved for control-plane bugs (SPEC_FULL
//! §4.2). Determinism: given identical inputs and a deterministic tool
//! registry, two runs produce byte-identical `action_results` up to
//! timestamps (§8 law 5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::automations::model::{Action, AutomationRecord, RESERVED_CONTEXT_KEYS};
use crate::engine::condition::evaluate;
use crate::engine::context::{Context, UserInfo};
use crate::engine::template::render_value;
use crate::notifications::NotificationHandler;
use crate::tools::{ExecuteOpts, ToolError, ToolRegistry};

const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 30;

/// Per-action outcome recorded into `ActionResult` (§3, §4.2 step 2d).
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success(Value),
    Skipped,
    Failed(String),
    Timeout,
    UsageLimitExceeded(String),
}

impl ActionOutcome {
    pub fn status_str(&self) -> &'static str {
        match self {
            ActionOutcome::Success(_) => "success",
            ActionOutcome::Skipped => "skipped",
            ActionOutcome::Failed(_) => "failed",
            ActionOutcome::Timeout => "timeout",
            ActionOutcome::UsageLimitExceeded(_) => "usage_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action_id: String,
    pub tool: String,
    pub outcome: ActionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Overall run status (§3 `ExecutionLog.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    PartialFailure,
    Failed,
    UsageLimitExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::PartialFailure => "partial_failure",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::UsageLimitExceeded => "usage_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub action_results: Vec<ActionResult>,
    pub actions_executed: usize,
    pub actions_failed: usize,
    pub error_summary: Option<String>,
}

pub struct ActionExecutor {
    tool_registry: Arc<dyn ToolRegistry>,
    notifications: Arc<dyn NotificationHandler>,
}

impl ActionExecutor {
    pub fn new(
        tool_registry: Arc<dyn ToolRegistry>,
        notifications: Arc<dyn NotificationHandler>,
    ) -> Self {
        Self {
            tool_registry,
            notifications,
        }
    }

    /// §4.2 entry point: `execute(automation, trigger_data, user_info)`.
    #[instrument(skip(self, automation, trigger_data, user), fields(automation_id = %automation.id))]
    pub async fn execute(
        &self,
        automation: &AutomationRecord,
        trigger_data: &Value,
        user: &UserInfo,
    ) -> ExecutionResult {
        self.execute_at(automation, trigger_data, user, Utc::now())
            .await
    }

    /// Clock-injectable variant so tests can assert determinism (§8 law 5)
    /// without depending on wall-clock time for the built-in datetime
    /// variables.
    pub async fn execute_at(
        &self,
        automation: &AutomationRecord,
        trigger_data: &Value,
        user: &UserInfo,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        let mut ctx = Context::build(trigger_data, user, &automation.variables, now);

        let mut results = Vec::with_capacity(automation.actions.len());
        let mut executed = 0usize;
        let mut failed = 0usize;
        let mut usage_limit_tool: Option<String> = None;

        for action in &automation.actions {
            let started_at = Utc::now();

            if let Some(condition) = &action.condition {
                if !evaluate(condition, &ctx.as_value()) {
                    results.push(ActionResult {
                        action_id: action.id.clone(),
                        tool: action.tool.clone(),
                        outcome: ActionOutcome::Skipped,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    continue;
                }
            }

            let params = render_value(&action.parameters, &ctx.as_value());
            let timeout = StdDuration::from_secs(
                action.timeout_secs.unwrap_or(DEFAULT_ACTION_TIMEOUT_SECS),
            );

            let dispatch = self.tool_registry.execute(
                &action.tool,
                params,
                &automation.owner_id,
                ExecuteOpts {
                    timeout_secs: action.timeout_secs,
                },
            );

            let outcome = match tokio::time::timeout(timeout, dispatch).await {
                Ok(Ok(value)) => {
                    executed += 1;
                    if let Some(output_as) = &action.output_as {
                        bind_output(&mut ctx, output_as, &value);
                    }
                    ActionOutcome::Success(value)
                }
                Ok(Err(e)) if e.is_usage_limit() => {
                    usage_limit_tool = Some(e.tool_name().to_string());
                    ActionOutcome::UsageLimitExceeded(e.tool_name().to_string())
                }
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(action_id = %action.id, tool = %action.tool, error = %e, "action failed");
                    ActionOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    failed += 1;
                    warn!(action_id = %action.id, tool = %action.tool, "action timed out");
                    ActionOutcome::Timeout
                }
            };

            let is_usage_limit = matches!(outcome, ActionOutcome::UsageLimitExceeded(_));
            results.push(ActionResult {
                action_id: action.id.clone(),
                tool: action.tool.clone(),
                outcome,
                started_at,
                finished_at: Utc::now(),
            });

            if is_usage_limit {
                self.notifications
                    .notify_usage_limit_exceeded(
                        &automation.owner_id,
                        &automation.id,
                        usage_limit_tool.as_deref().unwrap_or(&action.tool),
                    )
                    .await;
                break; // §4.2 step 2e: abort the remainder of the automation.
            }
        }

        let status = if usage_limit_tool.is_some() {
            ExecutionStatus::UsageLimitExceeded
        } else if failed == 0 {
            ExecutionStatus::Completed
        } else if executed > 0 {
            ExecutionStatus::PartialFailure
        } else {
            ExecutionStatus::Failed
        };

        let error_summary = if failed > 0 || usage_limit_tool.is_some() {
            Some(
                results
                    .iter()
                    .filter_map(|r| match &r.outcome {
                        ActionOutcome::Failed(e) => Some(format!("{}: {e}", r.action_id)),
                        ActionOutcome::Timeout => Some(format!("{}: timed out", r.action_id)),
                        ActionOutcome::UsageLimitExceeded(tool) => {
                            Some(format!("{}: usage limit exceeded for {tool}", r.action_id))
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        } else {
            None
        };

        info!(
            status = status.as_str(),
            executed, failed, "automation execution finished"
        );

        ExecutionResult {
            status,
            action_results: results,
            actions_executed: executed,
            actions_failed: failed,
            error_summary,
        }
    }
}

fn bind_output(ctx: &mut Context, name: &str, value: &Value) {
    if RESERVED_CONTEXT_KEYS.contains(&name) {
        // Invariant 4 is enforced at `Action::validate` time on authoring;
        // defensively ignore here rather than corrupt the reserved keys.
        warn!(output_as = %name, "refusing to bind output over a reserved context key");
        return;
    }
    ctx.bind_output(name, value.clone());
}
