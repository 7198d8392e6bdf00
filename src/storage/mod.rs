//! SQLite-backed persistence for automations, the event queue, and execution
//! history (§3, §4.3).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

use crate::automations::model::{Action, AutomationRecord, AutomationStatus, TriggerType};

/// Default timeout for individual SQLite queries. Prevents a hung query from
/// blocking a cadence loop indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AutomationRow {
    id: String,
    owner_id: String,
    name: String,
    status: String,
    trigger_type: String,
    trigger_config: String,
    actions: String,
    variables: String,
    next_poll_at: Option<String>,
    last_poll_cursor: Option<String>,
    polling_interval_minutes: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl AutomationRow {
    fn into_record(self) -> Result<AutomationRecord> {
        Ok(AutomationRecord {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            status: AutomationStatus::from_str(&self.status)
                .with_context(|| format!("unrecognized automation status: {}", self.status))?,
            trigger_type: TriggerType::from_str(&self.trigger_type)?,
            trigger_config: serde_json::from_str(&self.trigger_config)?,
            actions: serde_json::from_str(&self.actions)?,
            variables: serde_json::from_str(&self.variables)?,
            next_poll_at: self
                .next_poll_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
                .transpose()?,
            last_poll_cursor: self.last_poll_cursor,
            polling_interval_minutes: self.polling_interval_minutes,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&self.updated_at)?.with_timezone(&Utc),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub service: String,
    pub event_id: String,
    pub owner_id: String,
    /// `Some` when the producer already knows which single automation this
    /// event is for (a poll result); `None` for a webhook event, which the
    /// dispatcher fans out to every matching automation at claim time.
    /// Deliberately excluded from the dedup key (Invariant 1) — see
    /// `queue` module docs.
    pub automation_id: Option<String>,
    pub payload: String,
    pub status: String,
    pub created_at: String,
    pub claimed_at: Option<String>,
}

/// A freshly inserted event, or `None` when the `(service, event_id,
/// owner_id)` tuple already existed — the at-most-once dedup guarantee from
/// §4.3, Invariant 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEnqueueOutcome {
    Inserted(String),
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub automation_id: String,
    pub trigger_type: String,
    pub status: String,
    pub trigger_data: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ExecutionLogRow {
    id: String,
    automation_id: String,
    trigger_type: String,
    status: String,
    trigger_data: Option<String>,
    error: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl ExecutionLogRow {
    fn into_log(self) -> Result<ExecutionLog> {
        Ok(ExecutionLog {
            id: self.id,
            automation_id: self.automation_id,
            trigger_type: self.trigger_type,
            status: self.status,
            trigger_data: self
                .trigger_data
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            error: self.error,
            started_at: DateTime::parse_from_rfc3339(&self.started_at)?.with_timezone(&Utc),
            finished_at: self
                .finished_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub execution_log_id: String,
    pub action_id: String,
    pub tool: String,
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ActionResultRow {
    id: String,
    execution_log_id: String,
    action_id: String,
    tool: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl ActionResultRow {
    fn into_result(self) -> Result<ActionResult> {
        Ok(ActionResult {
            id: self.id,
            execution_log_id: self.execution_log_id,
            action_id: self.action_id,
            tool: self.tool,
            status: self.status,
            output: self.output.map(|s| serde_json::from_str(&s)).transpose()?,
            error: self.error,
            started_at: DateTime::parse_from_rfc3339(&self.started_at)?.with_timezone(&Utc),
            finished_at: self
                .finished_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("triggerd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Automations ────────────────────────────────────────────────────────

    pub async fn create_automation(
        &self,
        owner_id: &str,
        name: &str,
        trigger_type: TriggerType,
        trigger_config: &Value,
        actions: &[Action],
    ) -> Result<AutomationRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO automations
                (id, owner_id, name, status, trigger_type, trigger_config, actions, variables,
                 next_poll_at, last_poll_cursor, polling_interval_minutes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, '{}', NULL, NULL, NULL, ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(name)
        .bind(AutomationStatus::PendingReview.as_str())
        .bind(trigger_type.as_str())
        .bind(serde_json::to_string(trigger_config)?)
        .bind(serde_json::to_string(actions)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_automation(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("automation not found after insert"))
    }

    pub async fn get_automation(&self, id: &str) -> Result<Option<AutomationRecord>> {
        let row: Option<AutomationRow> = sqlx::query_as("SELECT * FROM automations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AutomationRow::into_record).transpose()
    }

    pub async fn list_automations(&self, owner_id: Option<&str>) -> Result<Vec<AutomationRecord>> {
        with_timeout(async {
            let rows: Vec<AutomationRow> = match owner_id {
                Some(owner) => {
                    sqlx::query_as(
                        "SELECT * FROM automations WHERE owner_id = ? ORDER BY created_at DESC",
                    )
                    .bind(owner)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as("SELECT * FROM automations ORDER BY created_at DESC")
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            rows.into_iter().map(AutomationRow::into_record).collect()
        })
        .await
    }

    /// Active automations of a given trigger type — the set the poller and
    /// scheduler select from each tick (§4.5, §4.6).
    pub async fn list_active_by_trigger_type(
        &self,
        trigger_type: TriggerType,
    ) -> Result<Vec<AutomationRecord>> {
        with_timeout(async {
            let rows: Vec<AutomationRow> = sqlx::query_as(
                "SELECT * FROM automations WHERE trigger_type = ? AND status = 'active'",
            )
            .bind(trigger_type.as_str())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(AutomationRow::into_record).collect()
        })
        .await
    }

    /// Active polling automations whose `next_poll_at` has arrived (or was
    /// never set — a freshly activated automation polls immediately) (§4.5
    /// step 1).
    pub async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<AutomationRecord>> {
        with_timeout(async {
            let rows: Vec<AutomationRow> = sqlx::query_as(
                "SELECT * FROM automations
                 WHERE trigger_type = 'polling' AND status = 'active'
                   AND (next_poll_at IS NULL OR next_poll_at <= ?)",
            )
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(AutomationRow::into_record).collect()
        })
        .await
    }

    pub async fn update_status(&self, id: &str, status: AutomationStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE automations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_automation(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM automations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance a polling automation's cursor and schedule its next poll.
    pub async fn update_poll_state(
        &self,
        id: &str,
        cursor: Option<&str>,
        next_poll_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE automations SET last_poll_cursor = ?, next_poll_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(cursor)
        .bind(next_poll_at.to_rfc3339())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Event queue (§4.3) ─────────────────────────────────────────────────

    /// Idempotent insert keyed on `(service, event_id, owner_id)` (Invariant
    /// 1) — `automation_id` is never part of this key, so two automations
    /// matching the same external event never produce two rows. A duplicate
    /// delivery — e.g. a webhook provider's at-least-once retry — is
    /// silently absorbed rather than re-enqueued. Pass `automation_id` when
    /// the producer already knows the single automation this event is for
    /// (a poll result); pass `None` for a webhook event and let
    /// `queue::Dispatcher` resolve matches at claim time.
    pub async fn enqueue_event(
        &self,
        service: &str,
        event_id: &str,
        owner_id: &str,
        automation_id: Option<&str>,
        payload: &Value,
    ) -> Result<EventEnqueueOutcome> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO events (id, service, event_id, owner_id, automation_id, payload, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
             ON CONFLICT (service, event_id, owner_id) DO NOTHING",
        )
        .bind(&id)
        .bind(service)
        .bind(event_id)
        .bind(owner_id)
        .bind(automation_id)
        .bind(serde_json::to_string(payload)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(EventEnqueueOutcome::Inserted(id))
        } else {
            Ok(EventEnqueueOutcome::Duplicate)
        }
    }

    /// Atomically claim up to `limit` pending events, flipping them to
    /// `claimed` in the same statement so two dispatchers never race on the
    /// same row (mirrors the claim-then-check-rows-affected pattern used for
    /// session claiming).
    pub async fn claim_next_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let candidates: Vec<EventRow> = sqlx::query_as(
                "SELECT * FROM events WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            let now = Utc::now().to_rfc3339();
            let mut claimed = Vec::with_capacity(candidates.len());
            for row in candidates {
                let result = sqlx::query(
                    "UPDATE events SET status = 'claimed', claimed_at = ? WHERE id = ? AND status = 'pending'",
                )
                .bind(&now)
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() > 0 {
                    claimed.push(row);
                }
            }
            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }

    pub async fn mark_event_done(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE events SET status = 'done' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_event_failed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE events SET status = 'failed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Execution logs & action results (§4.2) ────────────────────────────

    pub async fn start_execution_log(
        &self,
        automation_id: &str,
        trigger_type: &str,
        trigger_data: Option<&Value>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO execution_logs (id, automation_id, trigger_type, status, trigger_data, error, started_at, finished_at)
             VALUES (?, ?, ?, 'running', ?, NULL, ?, NULL)",
        )
        .bind(&id)
        .bind(automation_id)
        .bind(trigger_type)
        .bind(trigger_data.map(serde_json::to_string).transpose()?)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish_execution_log(
        &self,
        id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE execution_logs SET status = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_action_result(
        &self,
        execution_log_id: &str,
        action_id: &str,
        tool: &str,
        status: &str,
        output: Option<&Value>,
        error: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO action_results
                (id, execution_log_id, action_id, tool, status, output, error, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(execution_log_id)
        .bind(action_id)
        .bind(tool)
        .bind(status)
        .bind(output.map(serde_json::to_string).transpose()?)
        .bind(error)
        .bind(started_at.to_rfc3339())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_execution_logs(
        &self,
        automation_id: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionLog>> {
        let rows: Vec<ExecutionLogRow> = sqlx::query_as(
            "SELECT * FROM execution_logs WHERE automation_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionLogRow::into_log).collect()
    }

    pub async fn list_action_results(&self, execution_log_id: &str) -> Result<Vec<ActionResult>> {
        let rows: Vec<ActionResultRow> = sqlx::query_as(
            "SELECT * FROM action_results WHERE execution_log_id = ? ORDER BY started_at ASC",
        )
        .bind(execution_log_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(ActionResultRow::into_result)
            .collect()
    }

    /// Most recent execution of a given trigger type for an automation — used
    /// by the scheduler's dueness check (10-minute safety buffer, §4.6).
    pub async fn last_execution_for_trigger(
        &self,
        automation_id: &str,
        trigger_types: &[&str],
    ) -> Result<Option<ExecutionLog>> {
        let placeholders = trigger_types
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM execution_logs WHERE automation_id = ? AND trigger_type IN ({placeholders}) ORDER BY started_at DESC LIMIT 1"
        );
        let mut query = sqlx::query_as::<_, ExecutionLogRow>(&sql).bind(automation_id);
        for tt in trigger_types {
            query = query.bind(*tt);
        }
        let row: Option<ExecutionLogRow> = query.fetch_optional(&self.pool).await?;
        row.map(ExecutionLogRow::into_log).transpose()
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::model::TriggerType;
    use serde_json::json;

    async fn test_storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        Storage::new(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn creates_and_fetches_automation() {
        let storage = test_storage().await;
        let created = storage
            .create_automation(
                "owner-1",
                "Slack urgent pings",
                TriggerType::Webhook,
                &json!({"service": "slack"}),
                &[],
            )
            .await
            .unwrap();
        let fetched = storage.get_automation(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Slack urgent pings");
        assert_eq!(fetched.status, AutomationStatus::PendingReview);
    }

    #[tokio::test]
    async fn duplicate_event_enqueue_is_absorbed() {
        let storage = test_storage().await;

        let first = storage
            .enqueue_event("gmail", "evt-1", "owner-1", None, &json!({"a": 1}))
            .await
            .unwrap();
        assert!(matches!(first, EventEnqueueOutcome::Inserted(_)));

        let second = storage
            .enqueue_event("gmail", "evt-1", "owner-1", None, &json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(second, EventEnqueueOutcome::Duplicate);
    }

    #[tokio::test]
    async fn two_automations_matching_the_same_external_event_share_one_row() {
        // Invariant 1 is keyed on (service, event_id, owner_id) alone,
        // excluding automation_id — an external event that several
        // automations could match must not multiply rows.
        let storage = test_storage().await;
        let first = storage
            .enqueue_event("slack", "evt-1", "owner-1", None, &json!({"event_type": "message"}))
            .await
            .unwrap();
        assert!(matches!(first, EventEnqueueOutcome::Inserted(_)));

        let second = storage
            .enqueue_event("slack", "evt-1", "owner-1", None, &json!({"event_type": "message"}))
            .await
            .unwrap();
        assert_eq!(second, EventEnqueueOutcome::Duplicate);
    }

    #[tokio::test]
    async fn claim_next_events_flips_status_and_is_not_reclaimable() {
        let storage = test_storage().await;
        storage
            .enqueue_event("todoist", "evt-1", "owner-1", None, &json!({}))
            .await
            .unwrap();

        let claimed = storage.claim_next_events(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, "pending"); // snapshot read before the flip

        let claimed_again = storage.claim_next_events(10).await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn due_polling_excludes_future_next_poll_at_and_other_trigger_types() {
        let storage = test_storage().await;
        let due = storage
            .create_automation("owner-1", "Oura sleep", TriggerType::Polling, &json!({}), &[])
            .await
            .unwrap();
        let not_due = storage
            .create_automation("owner-1", "Todoist tasks", TriggerType::Polling, &json!({}), &[])
            .await
            .unwrap();
        storage
            .update_status(&due.id, AutomationStatus::Active)
            .await
            .unwrap();
        storage
            .update_status(&not_due.id, AutomationStatus::Active)
            .await
            .unwrap();
        storage
            .update_poll_state(&not_due.id, None, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let webhook = storage
            .create_automation("owner-1", "Slack ping", TriggerType::Webhook, &json!({}), &[])
            .await
            .unwrap();
        storage
            .update_status(&webhook.id, AutomationStatus::Active)
            .await
            .unwrap();

        let results = storage.list_due_polling(Utc::now()).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&due.id.as_str()));
        assert!(!ids.contains(&not_due.id.as_str()));
        assert!(!ids.contains(&webhook.id.as_str()));
    }

    #[tokio::test]
    async fn execution_log_round_trips_status_and_error() {
        let storage = test_storage().await;
        let automation = storage
            .create_automation("owner-1", "Scheduled", TriggerType::ScheduleOnce, &json!({}), &[])
            .await
            .unwrap();
        let log_id = storage
            .start_execution_log(&automation.id, "schedule_once", None)
            .await
            .unwrap();
        storage
            .finish_execution_log(&log_id, "usage_limit_exceeded", Some("hit plan cap"))
            .await
            .unwrap();

        let logs = storage.list_execution_logs(&automation.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "usage_limit_exceeded");
        assert_eq!(logs[0].error.as_deref(), Some("hit plan cap"));
    }
}
