//! Event Queue (C3, §4.3): a durable, deduplicated store of inbound events
//! awaiting dispatch.
//!
//! Enqueue is idempotent against `(service, event_id, owner_id)` alone
//! (Invariant 1) — storage-level dedup is the source of truth, and
//! `automation_id` is deliberately excluded from that key. A poll event
//! already knows the single automation it belongs to and carries that id
//! along (`EventQueue::enqueue`'s `automation_id` argument); a webhook event
//! carries `None` and is fanned out at claim time to every active webhook
//! automation whose service/event_type/filter match (§4.3 "looks up
//! matching automation records and invokes C2 for each match"). This is what
//! keeps two automations matching the same external event from producing
//! two rows — the old per-automation key did exactly that.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::automations::model::{AutomationRecord, TriggerType};
use crate::engine::{evaluate_raw_filter, ActionExecutor, ExecutionResult, UserInfo};
use crate::storage::{EventEnqueueOutcome, EventRow, Storage};
use crate::webhook::trigger_matches;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    Duplicate,
}

pub struct EventQueue {
    storage: Arc<Storage>,
}

impl EventQueue {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Idempotent insert (§4.3 "a duplicate insert is swallowed and reported
    /// as success"). Pass `automation_id` when the producer already knows
    /// which single automation this event belongs to (a poll result); pass
    /// `None` for a webhook event and let the dispatcher resolve matches at
    /// claim time (see module docs above).
    pub async fn enqueue(
        &self,
        service: &str,
        event_id: &str,
        owner_id: &str,
        automation_id: Option<&str>,
        payload: &Value,
    ) -> anyhow::Result<EnqueueResult> {
        match self
            .storage
            .enqueue_event(service, event_id, owner_id, automation_id, payload)
            .await?
        {
            EventEnqueueOutcome::Inserted(id) => {
                info!(event_id = %id, service, automation_id = ?automation_id, "event enqueued");
                Ok(EnqueueResult::Enqueued)
            }
            EventEnqueueOutcome::Duplicate => {
                warn!(service, event_id, owner_id, automation_id = ?automation_id, "duplicate event absorbed");
                Ok(EnqueueResult::Duplicate)
            }
        }
    }
}

/// The claim-based consumer described in §4.3: resolves each claimed event
/// to its automation record and runs it through the executor. Resolution of
/// a user's profile for `UserInfo` is left to the caller via `UserResolver`
/// since user records live outside this crate's persistence scope (§1).
#[async_trait::async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(&self, owner_id: &str) -> UserInfo;
}

/// Resolver that only ever fills in `id` — suitable when the caller has no
/// richer user directory wired up.
pub struct OwnerIdOnlyResolver;

#[async_trait::async_trait]
impl UserResolver for OwnerIdOnlyResolver {
    async fn resolve(&self, owner_id: &str) -> UserInfo {
        UserInfo {
            id: owner_id.to_string(),
            ..Default::default()
        }
    }
}

pub struct Dispatcher {
    storage: Arc<Storage>,
    executor: Arc<ActionExecutor>,
    user_resolver: Arc<dyn UserResolver>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<ActionExecutor>,
        user_resolver: Arc<dyn UserResolver>,
    ) -> Self {
        Self {
            storage,
            executor,
            user_resolver,
        }
    }

    /// Claim up to `limit` pending events and run each through the executor.
    /// Ordering between events is best-effort (§5) — the queue is
    /// claim-based, not strictly FIFO.
    pub async fn run_batch(&self, limit: i64) -> anyhow::Result<usize> {
        let claimed = self.storage.claim_next_events(limit).await?;
        let count = claimed.len();
        for event in claimed {
            let result = match event.automation_id.clone() {
                Some(automation_id) => self.dispatch_bound(&automation_id, &event).await,
                None => self.dispatch_matching(&event).await,
            };

            match result {
                Ok(()) => self.storage.mark_event_done(&event.id).await?,
                Err(e) => {
                    error!(error = %e, event_id = %event.id, "dispatch failed");
                    self.storage.mark_event_failed(&event.id).await?;
                }
            }
        }
        Ok(count)
    }

    /// An event synthesized for one specific automation (a poll result) —
    /// dispatch to it directly, no re-matching.
    async fn dispatch_bound(&self, automation_id: &str, event: &EventRow) -> anyhow::Result<()> {
        let automation = match self.storage.get_automation(automation_id).await? {
            Some(a) => a,
            None => {
                warn!(automation_id, "event references missing automation");
                return Ok(());
            }
        };
        if !automation.is_active() {
            // Invariant 3: never executed once inactive, even if the event
            // was enqueued while it was still active.
            return Ok(());
        }
        let trigger_data: Value = serde_json::from_str(&event.payload)?;
        self.dispatch_direct(&automation, automation.trigger_type.as_str(), &trigger_data)
            .await?;
        Ok(())
    }

    /// An event with no automation bound at enqueue time (a webhook) — fan
    /// out to every active webhook automation for this owner whose
    /// service/event_type/filter match (§4.3), invoking C2 once per match.
    /// Zero matches is a normal outcome, not a failure: the event is simply
    /// marked done having triggered nothing.
    async fn dispatch_matching(&self, event: &EventRow) -> anyhow::Result<()> {
        let payload: Value = serde_json::from_str(&event.payload)?;
        let event_type = payload.get("event_type").and_then(|v| v.as_str()).unwrap_or("");
        let trigger_data = payload.get("trigger_data").cloned().unwrap_or(Value::Null);

        let automations = self.storage.list_automations(Some(&event.owner_id)).await?;
        for automation in automations {
            if automation.trigger_type != TriggerType::Webhook || !automation.is_active() {
                continue;
            }
            if !trigger_matches(&automation.trigger_config, &event.service, event_type) {
                continue;
            }

            let filter = automation
                .trigger_config
                .get("filter")
                .or_else(|| automation.trigger_config.get("filters"))
                .cloned();
            let ctx = serde_json::json!({"trigger_data": trigger_data});
            if !evaluate_raw_filter(filter.as_ref(), &ctx) {
                continue;
            }

            if let Err(e) = self.dispatch_direct(&automation, "webhook", &trigger_data).await {
                error!(error = %e, automation_id = %automation.id, event_id = %event.id, "webhook dispatch failed");
            }
        }
        Ok(())
    }

    /// Run an automation against an arbitrary trigger payload without an
    /// event-queue row backing it — used by the scheduler's per-bucket
    /// dispatch, `/scheduler/trigger`, and `/execute` (§4.6, §6). Shares the
    /// execution-log/action-result bookkeeping with `dispatch_one` above.
    pub async fn dispatch_direct(
        &self,
        automation: &AutomationRecord,
        trigger_type: &str,
        trigger_data: &Value,
    ) -> anyhow::Result<ExecutionResult> {
        let user = self.user_resolver.resolve(&automation.owner_id).await;

        let log_id = self
            .storage
            .start_execution_log(&automation.id, trigger_type, Some(trigger_data))
            .await?;

        let result = self.executor.execute(automation, trigger_data, &user).await;

        for action_result in &result.action_results {
            let output = match &action_result.outcome {
                crate::engine::ActionOutcome::Success(v) => Some(v.clone()),
                _ => None,
            };
            let error = match &action_result.outcome {
                crate::engine::ActionOutcome::Failed(e) => Some(e.clone()),
                crate::engine::ActionOutcome::Timeout => Some("timed out".to_string()),
                crate::engine::ActionOutcome::UsageLimitExceeded(tool) => {
                    Some(format!("usage limit exceeded for {tool}"))
                }
                _ => None,
            };
            self.storage
                .record_action_result(
                    &log_id,
                    &action_result.action_id,
                    &action_result.tool,
                    action_result.outcome.status_str(),
                    output.as_ref(),
                    error.as_deref(),
                    action_result.started_at,
                )
                .await?;
        }

        self.storage
            .finish_execution_log(&log_id, result.status.as_str(), result.error_summary.as_deref())
            .await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::model::TriggerType;
    use crate::notifications::NoopNotificationHandler;
    use crate::tools::fake::FakeToolRegistry;
    use serde_json::json;

    #[tokio::test]
    async fn claim_and_dispatch_runs_executor_and_records_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());

        let mut automation = storage
            .create_automation(
                "owner-1",
                "Slack alert",
                TriggerType::Webhook,
                &json!({"service": "slack"}),
                &[crate::automations::model::Action {
                    id: "a1".to_string(),
                    tool: "noop".to_string(),
                    parameters: json!({}),
                    output_as: None,
                    condition: None,
                    timeout_secs: None,
                }],
            )
            .await
            .unwrap();
        storage
            .update_status(&automation.id, crate::automations::model::AutomationStatus::Active)
            .await
            .unwrap();
        automation = storage.get_automation(&automation.id).await.unwrap().unwrap();

        let queue = EventQueue::new(storage.clone());
        let enqueue_result = queue
            .enqueue("slack", "evt-1", "owner-1", Some(&automation.id), &json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(enqueue_result, EnqueueResult::Enqueued);

        let registry = Arc::new(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok"))));
        let executor = Arc::new(ActionExecutor::new(registry, Arc::new(NoopNotificationHandler)));
        let dispatcher = Dispatcher::new(storage.clone(), executor, Arc::new(OwnerIdOnlyResolver));

        let processed = dispatcher.run_batch(10).await.unwrap();
        assert_eq!(processed, 1);

        let logs = storage.list_execution_logs(&automation.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "completed");
    }

    #[tokio::test]
    async fn inactive_automation_is_never_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let automation = storage
            .create_automation("owner-1", "Paused", TriggerType::Webhook, &json!({}), &[])
            .await
            .unwrap();
        // left in pending_review — not active.

        let queue = EventQueue::new(storage.clone());
        queue
            .enqueue("slack", "evt-1", "owner-1", Some(&automation.id), &json!({}))
            .await
            .unwrap();

        let registry = Arc::new(FakeToolRegistry::new());
        let executor = Arc::new(ActionExecutor::new(registry, Arc::new(NoopNotificationHandler)));
        let dispatcher = Dispatcher::new(storage.clone(), executor, Arc::new(OwnerIdOnlyResolver));
        dispatcher.run_batch(10).await.unwrap();

        let logs = storage.list_execution_logs(&automation.id, 10).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn one_unbound_event_fans_out_to_every_matching_automation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());

        let mut first = storage
            .create_automation(
                "owner-1",
                "Forward to tool A",
                TriggerType::Webhook,
                &json!({"service": "slack"}),
                &[crate::automations::model::Action {
                    id: "a1".to_string(),
                    tool: "noop".to_string(),
                    parameters: json!({}),
                    output_as: None,
                    condition: None,
                    timeout_secs: None,
                }],
            )
            .await
            .unwrap();
        let mut second = storage
            .create_automation(
                "owner-1",
                "Forward to tool B",
                TriggerType::Webhook,
                &json!({"service": "slack"}),
                &[crate::automations::model::Action {
                    id: "a1".to_string(),
                    tool: "noop".to_string(),
                    parameters: json!({}),
                    output_as: None,
                    condition: None,
                    timeout_secs: None,
                }],
            )
            .await
            .unwrap();
        storage
            .update_status(&first.id, crate::automations::model::AutomationStatus::Active)
            .await
            .unwrap();
        storage
            .update_status(&second.id, crate::automations::model::AutomationStatus::Active)
            .await
            .unwrap();
        first = storage.get_automation(&first.id).await.unwrap().unwrap();
        second = storage.get_automation(&second.id).await.unwrap().unwrap();

        let queue = EventQueue::new(storage.clone());
        let payload = json!({"event_type": "message", "trigger_data": {"text": "hi"}});
        let enqueue_result = queue.enqueue("slack", "evt-1", "owner-1", None, &payload).await.unwrap();
        assert_eq!(enqueue_result, EnqueueResult::Enqueued);

        // A retry of the same external event must still land on the same
        // row, not a second one keyed by some automation id (Invariant 1).
        let retry_result = queue.enqueue("slack", "evt-1", "owner-1", None, &payload).await.unwrap();
        assert_eq!(retry_result, EnqueueResult::Duplicate);

        let registry = Arc::new(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok"))));
        let executor = Arc::new(ActionExecutor::new(registry, Arc::new(NoopNotificationHandler)));
        let dispatcher = Dispatcher::new(storage.clone(), executor, Arc::new(OwnerIdOnlyResolver));

        let processed = dispatcher.run_batch(10).await.unwrap();
        assert_eq!(processed, 1);

        assert_eq!(storage.list_execution_logs(&first.id, 10).await.unwrap().len(), 1);
        assert_eq!(storage.list_execution_logs(&second.id, 10).await.unwrap().len(), 1);
    }
}
