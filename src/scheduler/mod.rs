//! Scheduler (C6, §4.6): cadence-bucket dueness checks for time-based
//! triggers, one-time schedule handling, and dispatch via the shared
//! execution path in [`crate::queue::Dispatcher`].
//!
//! Unlike the poller (C5), which polls a source on a cadence and diffs its
//! output, the scheduler fires on the cadence itself — there is no item to
//! diff, so the dispatch payload is just a timestamp (§4.6 "a scheduled-time
//! stamp as the trigger payload").

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::automations::model::{AutomationRecord, AutomationStatus, TriggerType};
use crate::queue::Dispatcher;
use crate::storage::Storage;

const BATCH_SIZE: usize = 5;
const INTER_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Leniency applied to the interval cutoff so a scheduler tick that runs a
/// little late (or a little early, by clock skew) doesn't skip a bucket.
const SAFETY_BUFFER_MINUTES: i64 = 10;

const TRIGGER_TYPES_FOR_LAST_EXECUTION: &[&str] = &["schedule", "schedule_once", "schedule_recurring"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceBucket {
    FiveMin,
    FifteenMin,
    ThirtyMin,
    OneHour,
    SixHour,
    Daily,
    Weekly,
    Once,
}

impl CadenceBucket {
    pub const ALL: [CadenceBucket; 8] = [
        CadenceBucket::FiveMin,
        CadenceBucket::FifteenMin,
        CadenceBucket::ThirtyMin,
        CadenceBucket::OneHour,
        CadenceBucket::SixHour,
        CadenceBucket::Daily,
        CadenceBucket::Weekly,
        CadenceBucket::Once,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CadenceBucket::FiveMin => "5min",
            CadenceBucket::FifteenMin => "15min",
            CadenceBucket::ThirtyMin => "30min",
            CadenceBucket::OneHour => "1hr",
            CadenceBucket::SixHour => "6hr",
            CadenceBucket::Daily => "daily",
            CadenceBucket::Weekly => "weekly",
            CadenceBucket::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5min" => Some(CadenceBucket::FiveMin),
            "15min" => Some(CadenceBucket::FifteenMin),
            "30min" => Some(CadenceBucket::ThirtyMin),
            "1hr" => Some(CadenceBucket::OneHour),
            "6hr" => Some(CadenceBucket::SixHour),
            "daily" => Some(CadenceBucket::Daily),
            "weekly" => Some(CadenceBucket::Weekly),
            "once" => Some(CadenceBucket::Once),
            _ => None,
        }
    }

    /// Interval length in minutes, or `None` for the one-time bucket (which
    /// is gated by `run_at`, not a repeating interval).
    pub fn minutes(&self) -> Option<i64> {
        match self {
            CadenceBucket::FiveMin => Some(5),
            CadenceBucket::FifteenMin => Some(15),
            CadenceBucket::ThirtyMin => Some(30),
            CadenceBucket::OneHour => Some(60),
            CadenceBucket::SixHour => Some(360),
            CadenceBucket::Daily => Some(1440),
            CadenceBucket::Weekly => Some(10080),
            CadenceBucket::Once => None,
        }
    }
}

/// Projected next run for a scheduled automation, used by the
/// `/scheduler/scheduled-runs` introspection endpoint (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledRun {
    pub automation_id: String,
    pub name: String,
    pub bucket: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_overdue: bool,
}

pub struct Scheduler {
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
            batch_size: BATCH_SIZE,
        }
    }

    /// Find and dispatch every recurring automation due in `bucket`, or
    /// every one-time automation whose `run_at` has arrived.
    pub async fn run_bucket(&self, bucket: CadenceBucket) -> anyhow::Result<usize> {
        let now = Utc::now();
        let due = match bucket {
            CadenceBucket::Once => self.due_once(now).await?,
            _ => self.due_recurring(bucket, now).await?,
        };
        if due.is_empty() {
            return Ok(0);
        }
        info!(bucket = bucket.as_str(), count = due.len(), "scheduler bucket due");
        self.dispatch_batched(bucket, due, now).await
    }

    /// Run every bucket once — used by the `/scheduler/run` endpoint and the
    /// background scheduler loop's periodic sweep.
    pub async fn run_all(&self) -> anyhow::Result<usize> {
        let mut total = 0;
        for bucket in CadenceBucket::ALL {
            total += self.run_bucket(bucket).await?;
        }
        Ok(total)
    }

    /// Dispatch a single automation immediately, bypassing cadence checks
    /// (`/scheduler/trigger`, §6). Still honors invariant 3: an inactive
    /// automation is never executed.
    pub async fn trigger_now(&self, automation_id: &str) -> anyhow::Result<crate::engine::ExecutionResult> {
        let automation = self
            .storage
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("automation {automation_id} not found"))?;
        if !automation.is_active() {
            anyhow::bail!("automation {automation_id} is not active");
        }
        let now = Utc::now();
        let trigger_data = json!({"scheduled_time": now.to_rfc3339(), "manual": true});
        self.dispatcher
            .dispatch_direct(&automation, "manual", &trigger_data)
            .await
    }

    async fn due_recurring(&self, bucket: CadenceBucket, now: DateTime<Utc>) -> anyhow::Result<Vec<AutomationRecord>> {
        let interval_minutes = bucket.minutes().expect("non-once buckets carry an interval");
        let candidates = self
            .storage
            .list_active_by_trigger_type(TriggerType::ScheduleRecurring)
            .await?;
        let mut due = Vec::new();
        for automation in candidates {
            if bucket_of(&automation.trigger_config) != Some(bucket) {
                continue;
            }
            let last_exec_at = self
                .storage
                .last_execution_for_trigger(&automation.id, TRIGGER_TYPES_FOR_LAST_EXECUTION)
                .await?
                .map(|log| log.started_at);
            if !interval_cutoff_due(last_exec_at, now, interval_minutes) {
                continue;
            }
            let gated = match bucket {
                CadenceBucket::Daily => time_of_day_due(&automation.trigger_config, now),
                CadenceBucket::Weekly => {
                    time_of_day_due(&automation.trigger_config, now) && day_of_week_due(&automation.trigger_config, now)
                }
                _ => true,
            };
            if gated {
                due.push(automation);
            }
        }
        Ok(due)
    }

    async fn due_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<AutomationRecord>> {
        let candidates = self
            .storage
            .list_active_by_trigger_type(TriggerType::ScheduleOnce)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|a| run_at(&a.trigger_config).is_some_and(|run_at| run_at <= now))
            .collect())
    }

    async fn dispatch_batched(
        &self,
        bucket: CadenceBucket,
        due: Vec<AutomationRecord>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let trigger_data = json!({"scheduled_time": now.to_rfc3339(), "bucket": bucket.as_str()});
        let mut dispatched = 0;
        let chunks: Vec<&[AutomationRecord]> = due.chunks(self.batch_size).collect();
        for (idx, chunk) in chunks.iter().enumerate() {
            for automation in *chunk {
                match self
                    .dispatcher
                    .dispatch_direct(automation, automation.trigger_type.as_str(), &trigger_data)
                    .await
                {
                    Ok(_) => {
                        dispatched += 1;
                        if bucket == CadenceBucket::Once {
                            // One-shot: deactivate after a successful hand-off to
                            // the executor, regardless of per-action outcomes —
                            // it only ever gets one chance to fire.
                            if let Err(e) = self
                                .storage
                                .update_status(&automation.id, AutomationStatus::Disabled)
                                .await
                            {
                                error!(error = %e, automation_id = %automation.id, "failed to deactivate one-time schedule");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, automation_id = %automation.id, "scheduled dispatch failed");
                    }
                }
            }
            if idx + 1 < chunks.len() {
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
        }
        Ok(dispatched)
    }

    /// Projected next-run times for every schedule-driven automation owned
    /// by `owner_id` (or all owners if `None`), for the
    /// `/scheduler/scheduled-runs` endpoint.
    pub async fn scheduled_runs(&self, owner_id: Option<&str>) -> anyhow::Result<Vec<ScheduledRun>> {
        let now = Utc::now();
        let mut runs = Vec::new();
        for trigger_type in [TriggerType::ScheduleRecurring, TriggerType::ScheduleOnce] {
            for automation in self.storage.list_active_by_trigger_type(trigger_type).await? {
                if let Some(owner) = owner_id {
                    if automation.owner_id != owner {
                        continue;
                    }
                }
                let last_run_at = self
                    .storage
                    .last_execution_for_trigger(&automation.id, TRIGGER_TYPES_FOR_LAST_EXECUTION)
                    .await?
                    .map(|log| log.started_at);
                let bucket = bucket_of(&automation.trigger_config);
                let (next_run_at, is_overdue) = match trigger_type {
                    TriggerType::ScheduleOnce => {
                        let at = run_at(&automation.trigger_config);
                        let overdue = at.is_some_and(|t| t <= now);
                        (at, overdue)
                    }
                    _ => match bucket {
                        Some(b) => {
                            let next = project_next_run(b, &automation.trigger_config, last_run_at, now);
                            let overdue = next <= now;
                            (Some(next), overdue)
                        }
                        None => (None, false),
                    },
                };
                runs.push(ScheduledRun {
                    automation_id: automation.id.clone(),
                    name: automation.name.clone(),
                    bucket: bucket.map(|b| b.as_str().to_string()),
                    next_run_at,
                    last_run_at,
                    is_overdue,
                });
            }
        }
        Ok(runs)
    }
}

fn bucket_of(trigger_config: &Value) -> Option<CadenceBucket> {
    trigger_config.get("interval").and_then(|v| v.as_str()).and_then(CadenceBucket::parse)
}

fn run_at(trigger_config: &Value) -> Option<DateTime<Utc>> {
    trigger_config
        .get("run_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn interval_cutoff_due(last_exec_at: Option<DateTime<Utc>>, now: DateTime<Utc>, interval_minutes: i64) -> bool {
    match last_exec_at {
        None => true,
        Some(last) => {
            let effective_interval = (interval_minutes - SAFETY_BUFFER_MINUTES).max(0);
            last <= now - ChronoDuration::minutes(effective_interval)
        }
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// Daily/weekly automations carry an explicit `time_of_day` ("HH:MM", UTC);
/// absence means no time-of-day gate applies. Due within the 5-minute tick
/// window containing that time.
fn time_of_day_due(trigger_config: &Value, now: DateTime<Utc>) -> bool {
    let Some(time_of_day) = trigger_config.get("time_of_day").and_then(|v| v.as_str()) else {
        return true;
    };
    let Some((h, m)) = parse_hhmm(time_of_day) else {
        return true;
    };
    let target_minutes = (h * 60 + m) as i64;
    let now_minutes = (now.hour() * 60 + now.minute()) as i64;
    let window_start = (now_minutes / 5) * 5;
    target_minutes >= window_start && target_minutes < window_start + 5
}

fn day_name_to_num(s: &str) -> Option<i64> {
    match s.to_ascii_lowercase().as_str() {
        "sunday" | "sun" => Some(0),
        "monday" | "mon" => Some(1),
        "tuesday" | "tue" => Some(2),
        "wednesday" | "wed" => Some(3),
        "thursday" | "thu" => Some(4),
        "friday" | "fri" => Some(5),
        "saturday" | "sat" => Some(6),
        _ => None,
    }
}

fn target_day_of_week(trigger_config: &Value) -> Option<i64> {
    let v = trigger_config.get("day_of_week")?;
    if let Some(n) = v.as_i64() {
        return (0..=6).contains(&n).then_some(n);
    }
    v.as_str().and_then(day_name_to_num)
}

fn day_of_week_due(trigger_config: &Value, now: DateTime<Utc>) -> bool {
    match target_day_of_week(trigger_config) {
        None => true,
        Some(target) => now.weekday().num_days_from_sunday() as i64 == target,
    }
}

fn project_next_run(
    bucket: CadenceBucket,
    trigger_config: &Value,
    last_exec_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match bucket {
        CadenceBucket::Daily | CadenceBucket::Weekly => {
            let (h, m) = trigger_config
                .get("time_of_day")
                .and_then(|v| v.as_str())
                .and_then(parse_hhmm)
                .unwrap_or((0, 0));
            let mut candidate = now
                .date_naive()
                .and_hms_opt(h, m, 0)
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
                .unwrap_or(now);
            if candidate <= now {
                candidate += ChronoDuration::days(1);
            }
            if bucket == CadenceBucket::Weekly {
                if let Some(target) = target_day_of_week(trigger_config) {
                    while candidate.weekday().num_days_from_sunday() as i64 != target {
                        candidate += ChronoDuration::days(1);
                    }
                }
            }
            candidate
        }
        _ => {
            let interval_minutes = bucket.minutes().unwrap_or(15);
            let base = last_exec_at.unwrap_or(now);
            base + ChronoDuration::minutes(interval_minutes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::model::Action;
    use crate::engine::ActionExecutor;
    use crate::notifications::NoopNotificationHandler;
    use crate::queue::OwnerIdOnlyResolver;
    use crate::tools::fake::FakeToolRegistry;

    async fn scheduler_with(registry: FakeToolRegistry) -> (Scheduler, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let executor = Arc::new(ActionExecutor::new(Arc::new(registry), Arc::new(NoopNotificationHandler)));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), executor, Arc::new(OwnerIdOnlyResolver)));
        let scheduler = Scheduler::new(storage.clone(), dispatcher);
        (scheduler, storage)
    }

    async fn make_automation(
        storage: &Storage,
        trigger_type: TriggerType,
        trigger_config: Value,
    ) -> AutomationRecord {
        let automation = storage
            .create_automation(
                "owner-1",
                "sched",
                trigger_type,
                &trigger_config,
                &[Action {
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
        storage.update_status(&automation.id, AutomationStatus::Active).await.unwrap();
        storage.get_automation(&automation.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn never_executed_recurring_automation_is_due_immediately() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        make_automation(&storage, TriggerType::ScheduleRecurring, json!({"interval": "15min"})).await;

        let dispatched = scheduler.run_bucket(CadenceBucket::FifteenMin).await.unwrap();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn recently_run_recurring_automation_is_skipped() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        let automation = make_automation(&storage, TriggerType::ScheduleRecurring, json!({"interval": "1hr"})).await;

        assert_eq!(scheduler.run_bucket(CadenceBucket::OneHour).await.unwrap(), 1);
        // Fires once; the second sweep moments later must not re-fire.
        assert_eq!(scheduler.run_bucket(CadenceBucket::OneHour).await.unwrap(), 0);

        let logs = storage.list_execution_logs(&automation.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn once_bucket_deactivates_after_dispatch() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        let run_at = Utc::now() - ChronoDuration::minutes(1);
        let automation = make_automation(
            &storage,
            TriggerType::ScheduleOnce,
            json!({"run_at": run_at.to_rfc3339()}),
        )
        .await;

        let dispatched = scheduler.run_bucket(CadenceBucket::Once).await.unwrap();
        assert_eq!(dispatched, 1);

        let reloaded = storage.get_automation(&automation.id).await.unwrap().unwrap();
        assert!(!reloaded.is_active());

        // A second sweep must not find it anymore (no longer active).
        assert_eq!(scheduler.run_bucket(CadenceBucket::Once).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn future_one_time_schedule_is_not_due() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        let run_at = Utc::now() + ChronoDuration::hours(1);
        make_automation(&storage, TriggerType::ScheduleOnce, json!({"run_at": run_at.to_rfc3339()})).await;

        assert_eq!(scheduler.run_bucket(CadenceBucket::Once).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn daily_time_of_day_gate_outside_window_is_skipped() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        let now = Utc::now();
        let off_hour = (now.hour() + 6) % 24;
        make_automation(
            &storage,
            TriggerType::ScheduleRecurring,
            json!({"interval": "daily", "time_of_day": format!("{off_hour:02}:00")}),
        )
        .await;

        assert_eq!(scheduler.run_bucket(CadenceBucket::Daily).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trigger_now_rejects_inactive_automation() {
        let (scheduler, storage) = scheduler_with(FakeToolRegistry::new().with_tool("noop", |_| Ok(json!("ok")))).await;
        let automation = storage
            .create_automation("owner-1", "paused", TriggerType::ScheduleRecurring, &json!({"interval": "5min"}), &[])
            .await
            .unwrap();
        // left pending_review.

        let result = scheduler.trigger_now(&automation.id).await;
        assert!(result.is_err());
    }

    #[test]
    fn interval_cutoff_applies_safety_buffer() {
        let now = Utc::now();
        let fourteen_minutes_ago = now - ChronoDuration::minutes(14);
        // 15min bucket, buffer 10 -> effective cutoff is 5 minutes; 14 > 5 so due.
        assert!(interval_cutoff_due(Some(fourteen_minutes_ago), now, 15));
        let two_minutes_ago = now - ChronoDuration::minutes(2);
        assert!(!interval_cutoff_due(Some(two_minutes_ago), now, 15));
    }

    #[test]
    fn day_of_week_accepts_names_and_numbers() {
        let cfg_name = json!({"day_of_week": "Monday"});
        let cfg_num = json!({"day_of_week": 1});
        assert_eq!(target_day_of_week(&cfg_name), Some(1));
        assert_eq!(target_day_of_week(&cfg_num), Some(1));
    }
}
