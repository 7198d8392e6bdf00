use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4700;
const DEFAULT_POLL_BATCH_SIZE: usize = 5;
const DEFAULT_POLL_INTERVAL_MINUTES: i64 = 15;
const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SCHEDULER_BATCH_SIZE: usize = 5;

/// Per-service polling defaults (§6): minutes between polls when an
/// automation's `trigger_config.polling_interval_minutes` is unset.
pub fn default_polling_interval_minutes(source_tool: &str) -> i64 {
    let lower = source_tool.to_ascii_lowercase();
    if lower.contains("oura") {
        60
    } else if lower.contains("fitbit") {
        15
    } else if lower.contains("todoist") {
        5
    } else if lower.contains("google_calendar") || lower.contains("gcal") {
        10
    } else if lower.contains("outlook_calendar") {
        10
    } else if lower.contains("excel") {
        10
    } else if lower.contains("word") {
        15
    } else if lower.contains("notion") {
        10
    } else {
        15
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP bind port (default: 4700).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,triggerd=trace" (default: "info").
    log: Option<String>,
    /// Poller concurrency cap (default: 5).
    poll_batch_size: Option<usize>,
    /// Default polling cadence in minutes for services with no tagged default (default: 15).
    default_poll_interval_minutes: Option<i64>,
    /// Default per-action tool-invocation timeout in seconds (default: 30).
    action_timeout_secs: Option<u64>,
    /// Scheduler dispatch batch size (default: 5).
    scheduler_batch_size: Option<usize>,
    /// Per-service webhook signing secrets, e.g. `[webhook_secrets] slack = "..."`.
    webhook_secrets: Option<HashMap<String, String>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── EngineConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Max automations polled concurrently per poller tick.
    pub poll_batch_size: usize,
    /// Polling cadence for services without a tagged default.
    pub default_poll_interval_minutes: i64,
    /// Default per-action tool timeout.
    pub action_timeout_secs: u64,
    /// Scheduler dispatch batch size.
    pub scheduler_batch_size: usize,
    /// Per-service HMAC signing secrets (service name -> secret).
    pub webhook_secrets: HashMap<String, String>,
}

impl EngineConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let poll_batch_size = toml.poll_batch_size.unwrap_or(DEFAULT_POLL_BATCH_SIZE);
        let default_poll_interval_minutes = toml
            .default_poll_interval_minutes
            .unwrap_or(DEFAULT_POLL_INTERVAL_MINUTES);
        let action_timeout_secs = toml
            .action_timeout_secs
            .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECS);
        let scheduler_batch_size = toml
            .scheduler_batch_size
            .unwrap_or(DEFAULT_SCHEDULER_BATCH_SIZE);
        let webhook_secrets = toml.webhook_secrets.unwrap_or_default();

        Self {
            port,
            data_dir,
            log,
            poll_batch_size,
            default_poll_interval_minutes,
            action_timeout_secs,
            scheduler_batch_size,
            webhook_secrets,
        }
    }

    pub fn webhook_secret(&self, service: &str) -> Option<&str> {
        self.webhook_secrets.get(service).map(|s| s.as_str())
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("triggerd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("triggerd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("triggerd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("triggerd");
        }
    }
    PathBuf::from(".triggerd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_services_default_to_their_documented_cadence() {
        assert_eq!(default_polling_interval_minutes("oura_get_daily_sleep"), 60);
        assert_eq!(default_polling_interval_minutes("fitbit_get_activity"), 15);
        assert_eq!(default_polling_interval_minutes("todoist_list_tasks"), 5);
        assert_eq!(default_polling_interval_minutes("unknown_source"), 15);
    }
}
