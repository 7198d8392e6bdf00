//! Health/Wellness tool classification cache (§4.5 step 6, §9 "Cross-cutting
//! Health service classification").
//!
//! The poller defaults unlabeled polling automations to `latest`
//! aggregation when their `source_tool` is tagged `health_and_wellness` by
//! the tool registry, else `per_item`. The tag lookup is memoized per
//! process lifetime — the registry's tagging table doesn't change mid-run —
//! with an explicit `invalidate` escape hatch for an admin signal (§9: "do
//! not hard-code a service list — the tagging table is authoritative").

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::tools::{ToolRegistry, HEALTH_AND_WELLNESS_TAG};

static CACHE: Lazy<RwLock<HashMap<String, bool>>> = Lazy::new(|| RwLock::new(HashMap::new()));

pub async fn is_health_and_wellness(registry: &dyn ToolRegistry, source_tool: &str) -> bool {
    if let Some(cached) = CACHE.read().unwrap().get(source_tool) {
        return *cached;
    }

    let is_health = registry
        .get_by_name(source_tool)
        .await
        .map(|meta| meta.tags.iter().any(|t| t == HEALTH_AND_WELLNESS_TAG))
        .unwrap_or(false);

    CACHE.write().unwrap().insert(source_tool.to_string(), is_health);
    is_health
}

/// Drop one tool's cached classification (or everything, if `None`) — the
/// admin-signal invalidation path (§9).
pub fn invalidate(source_tool: Option<&str>) {
    let mut cache = CACHE.write().unwrap();
    match source_tool {
        Some(name) => {
            cache.remove(name);
        }
        None => cache.clear(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeToolRegistry;

    #[tokio::test]
    async fn memoizes_tag_lookup_across_calls() {
        invalidate(None);
        let registry = FakeToolRegistry::new()
            .with_tool("oura_get_daily_sleep", |_| Ok(serde_json::json!({})))
            .with_tag("oura_get_daily_sleep", HEALTH_AND_WELLNESS_TAG);
        assert!(is_health_and_wellness(&registry, "oura_get_daily_sleep").await);
        assert!(!is_health_and_wellness(&registry, "todoist_list_tasks").await);
    }
}
