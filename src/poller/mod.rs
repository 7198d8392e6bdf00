//! Poller (C5, §4.5): on a cadence, invoke each due polling automation's
//! source tool, diff its output against a stored cursor, filter/aggregate
//! the new items, and enqueue the resulting events.

pub mod aggregate;
pub mod cursor;
pub mod extract;
pub mod health_tags;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::automations::model::AutomationRecord;
use crate::queue::EventQueue;
use crate::storage::Storage;
use crate::tools::{ExecuteOpts, ToolError, ToolRegistry};
use crate::value::get_path;
use aggregate::AggregationMode;

/// Max concurrently-polled automations per tick (§5 "bounded worker pool").
const DEFAULT_BATCH_SIZE: usize = 5;
/// Pause between batches to avoid stampeding upstream services (§4.5
/// "Selection").
const INTER_BATCH_DELAY: Duration = Duration::from_secs(1);

/// Totals for one poller tick, surfaced to callers for logging/metrics
/// (§4.5 step 8).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollMetrics {
    pub automations_polled: usize,
    pub items_found: usize,
    pub items_filtered_out: usize,
    pub events_created: usize,
    pub failures: usize,
}

impl PollMetrics {
    fn merge(&mut self, other: PollMetrics) {
        self.automations_polled += other.automations_polled;
        self.items_found += other.items_found;
        self.items_filtered_out += other.items_filtered_out;
        self.events_created += other.events_created;
        self.failures += other.failures;
    }
}

pub struct Poller {
    storage: Arc<Storage>,
    registry: Arc<dyn ToolRegistry>,
    queue: Arc<EventQueue>,
    batch_size: usize,
    default_interval_minutes: i64,
    action_timeout: Duration,
}

impl Poller {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<dyn ToolRegistry>,
        queue: Arc<EventQueue>,
        batch_size: usize,
        default_interval_minutes: i64,
        action_timeout_secs: u64,
    ) -> Self {
        Self {
            storage,
            registry,
            queue,
            batch_size: if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size },
            default_interval_minutes,
            action_timeout: Duration::from_secs(action_timeout_secs),
        }
    }

    /// Poll every due automation, `batch_size` at a time (§4.5 "Selection").
    pub async fn run_due(&self) -> anyhow::Result<PollMetrics> {
        let due = self.storage.list_due_polling(Utc::now()).await?;
        self.run_many(due).await
    }

    /// Poll every due automation whose `trigger_config.service` matches
    /// `category` (case-insensitive), or every due automation when `category`
    /// is `None` — used by `POST /scheduler/polling {category}` (§6).
    pub async fn run_due_category(&self, category: Option<&str>) -> anyhow::Result<PollMetrics> {
        let due = self.storage.list_due_polling(Utc::now()).await?;
        let filtered = match category {
            None => due,
            Some(category) => due
                .into_iter()
                .filter(|a| trigger_service(&a.trigger_config).eq_ignore_ascii_case(category))
                .collect(),
        };
        self.run_many(filtered).await
    }

    /// Force-poll a single automation regardless of `next_poll_at`, used by
    /// `POST /scheduler/polling {automation_id}` (§6).
    pub async fn run_one_forced(&self, automation_id: &str) -> anyhow::Result<PollMetrics> {
        let automation = self
            .storage
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("automation {automation_id} not found"))?;
        self.run_many(vec![automation]).await
    }

    async fn run_many(&self, due: Vec<AutomationRecord>) -> anyhow::Result<PollMetrics> {
        let mut totals = PollMetrics::default();
        let semaphore = Arc::new(Semaphore::new(self.batch_size));
        let chunks: Vec<&[AutomationRecord]> = due.chunks(self.batch_size).collect();
        for (idx, chunk) in chunks.iter().enumerate() {
            let mut handles = Vec::with_capacity(chunk.len());
            for automation in chunk {
                let permit = semaphore.clone().acquire_owned().await?;
                let automation = automation.clone();
                let storage = self.storage.clone();
                let registry = self.registry.clone();
                let queue = self.queue.clone();
                let default_interval_minutes = self.default_interval_minutes;
                let action_timeout = self.action_timeout;
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    poll_one(
                        &storage,
                        registry.as_ref(),
                        &queue,
                        &automation,
                        default_interval_minutes,
                        action_timeout,
                    )
                    .await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(Ok(metrics)) => totals.merge(metrics),
                    Ok(Err(e)) => {
                        warn!(error = %e, "poll of one automation failed");
                        totals.failures += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "poll task panicked");
                        totals.failures += 1;
                    }
                }
            }
            if idx + 1 < chunks.len() {
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
        }
        info!(
            automations_polled = totals.automations_polled,
            items_found = totals.items_found,
            items_filtered_out = totals.items_filtered_out,
            events_created = totals.events_created,
            failures = totals.failures,
            "poller tick complete"
        );
        Ok(totals)
    }
}

/// Fields pulled out of `trigger_config` for `trigger_type=polling` (§6).
struct PollingConfig {
    source_tool: String,
    tool_params: Value,
    event_type: String,
    filter: Option<Value>,
    aggregation_mode: Option<AggregationMode>,
    polling_interval_minutes: Option<i64>,
}

fn parse_trigger_config(config: &Value) -> anyhow::Result<PollingConfig> {
    let source_tool = config
        .get("source_tool")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("polling trigger_config missing source_tool"))?
        .to_string();
    let tool_params = config.get("tool_params").cloned().unwrap_or(json!({}));
    let event_type = config
        .get("event_type")
        .and_then(|v| v.as_str())
        .unwrap_or("poll")
        .to_string();
    let filter = config.get("filter").or_else(|| config.get("filters")).cloned();
    let aggregation_mode = config
        .get("aggregation_mode")
        .and_then(|v| v.as_str())
        .and_then(AggregationMode::parse);
    let polling_interval_minutes = config
        .get("polling_interval_minutes")
        .and_then(|v| v.as_i64());

    Ok(PollingConfig {
        source_tool,
        tool_params,
        event_type,
        filter,
        aggregation_mode,
        polling_interval_minutes,
    })
}

/// Name-based heuristic for defaulting `start_date`/`end_date` on health and
/// fitness tools (§4.5 step 2) — deliberately distinct from the
/// registry-tag-based check in [`health_tags`] that the aggregation-mode
/// default (step 6) uses; the spec keys these two decisions off different
/// signals.
fn looks_like_health_tool(source_tool: &str) -> bool {
    let lower = source_tool.to_ascii_lowercase();
    ["oura", "fitbit", "whoop", "health", "sleep", "activity", "garmin"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Build the small template context used to materialize `tool_params`
/// (§4.5 step 2): `{{last_cursor}}`, `{{today}}`, `{{yesterday}}`.
fn param_context(last_cursor: Option<&str>) -> Value {
    let today = Utc::now().date_naive();
    let yesterday = today - chrono::Duration::days(1);
    json!({
        "last_cursor": last_cursor,
        "today": today.format("%Y-%m-%d").to_string(),
        "yesterday": yesterday.format("%Y-%m-%d").to_string(),
    })
}

fn materialize_params(cfg: &PollingConfig, last_cursor: Option<&str>) -> Value {
    let ctx = param_context(last_cursor);
    let mut rendered = crate::engine::template::render_value(&cfg.tool_params, &ctx);

    if looks_like_health_tool(&cfg.source_tool) {
        let yesterday = ctx["yesterday"].as_str().unwrap_or_default();
        let today = ctx["today"].as_str().unwrap_or_default();
        let defaults = [
            ("start_date", last_cursor.unwrap_or(yesterday)),
            ("end_date", today),
        ];
        if let Value::Object(map) = &mut rendered {
            for (key, value) in defaults {
                map.entry(key.to_string())
                    .or_insert_with(|| Value::String(value.to_string()));
            }
        }
    }

    rendered
}

/// Best-effort event id for dedup — prefer the item's own identifier,
/// falling back to its cursor value so two items on the same date without
/// an id still get distinct keys often enough to avoid collapsing them.
fn synthesize_event_id(automation_id: &str, item: &Value) -> String {
    match extract::item_identifier(item) {
        Some(id) => format!("{automation_id}:{id}"),
        None => format!("{automation_id}:{}", extract::item_cursor_value(item)),
    }
}

async fn poll_one(
    storage: &Storage,
    registry: &dyn ToolRegistry,
    queue: &EventQueue,
    automation: &AutomationRecord,
    default_interval_minutes: i64,
    action_timeout: Duration,
) -> anyhow::Result<PollMetrics> {
    let mut metrics = PollMetrics {
        automations_polled: 1,
        ..Default::default()
    };

    let cfg = parse_trigger_config(&automation.trigger_config)?;
    let last_cursor = automation.last_poll_cursor.clone();
    let params = materialize_params(&cfg, last_cursor.as_deref());

    let interval_minutes = automation
        .polling_interval_minutes
        .or(cfg.polling_interval_minutes)
        .unwrap_or_else(|| {
            let tagged = crate::config::default_polling_interval_minutes(&cfg.source_tool);
            if tagged != 15 {
                tagged
            } else {
                default_interval_minutes
            }
        });

    let raw = match tokio::time::timeout(
        action_timeout,
        registry.execute(&cfg.source_tool, params, &automation.owner_id, ExecuteOpts {
            timeout_secs: Some(action_timeout.as_secs()),
        }),
    )
    .await
    {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(automation_id = %automation.id, tool = %cfg.source_tool, error = %e, "poll source tool failed");
            advance_next_poll_only(storage, automation, interval_minutes).await?;
            metrics.failures += 1;
            return Ok(metrics);
        }
        Err(_) => {
            warn!(automation_id = %automation.id, tool = %cfg.source_tool, "poll source tool timed out");
            advance_next_poll_only(storage, automation, interval_minutes).await?;
            metrics.failures += 1;
            return Ok(metrics);
        }
    };

    let items = extract::extract_items(&raw);
    metrics.items_found += items.len();

    let new_items: Vec<Value> = items
        .iter()
        .filter(|item| cursor::is_newer(&extract::item_cursor_value(item), last_cursor.as_deref()))
        .cloned()
        .collect();
    metrics.items_filtered_out += items.len() - new_items.len();

    let mode = cfg.aggregation_mode.unwrap_or({
        if health_tags::is_health_and_wellness(registry, &cfg.source_tool).await {
            AggregationMode::Latest
        } else {
            AggregationMode::PerItem
        }
    });

    let aggregated = match mode {
        AggregationMode::PerItem => aggregate::per_item(
            &new_items,
            cfg.filter.as_ref(),
            &cfg.event_type,
            &automation.id,
            |item| synthesize_event_id(&automation.id, item),
        ),
        AggregationMode::Batch => {
            let event_id = format!("{}:{}", automation.id, Utc::now().timestamp());
            aggregate::batch(&new_items, cfg.filter.as_ref(), event_id)
                .into_iter()
                .collect()
        }
        AggregationMode::Summary => {
            let event_id = format!("{}:{}", automation.id, Utc::now().timestamp());
            aggregate::summary(&new_items, cfg.filter.as_ref(), event_id)
                .into_iter()
                .collect()
        }
        AggregationMode::Latest => {
            let event_id = format!("{}:{}", automation.id, Utc::now().timestamp());
            aggregate::latest(&raw, cfg.filter.as_ref(), event_id)
                .into_iter()
                .collect()
        }
    };

    for event in &aggregated {
        queue
            .enqueue(
                &trigger_service(&automation.trigger_config),
                &event.event_id,
                &automation.owner_id,
                Some(&automation.id),
                &event.payload,
            )
            .await?;
    }
    metrics.events_created += aggregated.len();

    // Advance the cursor over every extracted item (not just the filtered
    // "new" ones) so a poll that sees no new items still folds forward past
    // any signature-only items it already admitted previously.
    let next_cursor = items
        .iter()
        .map(|item| extract::item_cursor_value(item))
        .fold(last_cursor.clone(), |acc, candidate| match acc {
            None => Some(candidate),
            Some(current) => Some(cursor::max_cursor(&current, &candidate).to_string()),
        });

    storage
        .update_poll_state(
            &automation.id,
            next_cursor.as_deref(),
            Utc::now() + chrono::Duration::minutes(interval_minutes),
        )
        .await?;

    Ok(metrics)
}

async fn advance_next_poll_only(
    storage: &Storage,
    automation: &AutomationRecord,
    interval_minutes: i64,
) -> anyhow::Result<()> {
    storage
        .update_poll_state(
            &automation.id,
            automation.last_poll_cursor.as_deref(),
            Utc::now() + chrono::Duration::minutes(interval_minutes),
        )
        .await?;
    Ok(())
}

fn trigger_service(trigger_config: &Value) -> String {
    get_path(trigger_config, "service")
        .and_then(|v| v.as_str())
        .unwrap_or("polling")
        .to_string()
}
