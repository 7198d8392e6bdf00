//! The tool registry — an external collaborator (§1, §6 "Tool-registry
//! contract"). This crate only depends on its trait-object interface: a
//! lookup for metadata/handler and a dispatch call that returns an opaque
//! JSON value or a typed error.
//!
//! §9 Open Question 1 decides to type the registry's error taxonomy now
//! (`ToolError`) rather than leave it opaque, since the executor's
//! usage-limit branch (§4.2.e) already needs to distinguish at least one
//! variant — the rest of the taxonomy costs nothing extra and lets future
//! retry logic key off `Transient` without re-deriving it.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Typed failure from a tool invocation. `UsageLimit` is the sentinel the
/// executor treats specially (§4.2.e, §7): it aborts the remaining action
/// list rather than simply recording a per-action failure.
#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("tool '{0}' requires reauthorization")]
    Auth(String),
    #[error("tool '{0}' is rate-limited, retry after {retry_after_secs:?}s", retry_after_secs = .1)]
    RateLimit(String, Option<u64>),
    #[error("tool '{0}' usage limit exceeded")]
    UsageLimit(String),
    #[error("tool '{0}' failed transiently: {1}")]
    Transient(String, String),
    #[error("tool '{0}' failed: {1}")]
    Permanent(String, String),
}

impl ToolError {
    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::Auth(t)
            | ToolError::RateLimit(t, _)
            | ToolError::UsageLimit(t)
            | ToolError::Transient(t, _)
            | ToolError::Permanent(t, _) => t,
        }
    }

    pub fn is_usage_limit(&self) -> bool {
        matches!(self, ToolError::UsageLimit(_))
    }
}

/// Metadata the registry returns for a named tool (§6: `get_by_name`).
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub returns_schema: Value,
    /// Tags attached by the registry's classification system — e.g.
    /// `"health_and_wellness"` drives the poller's aggregation-mode default
    /// (§4.5 step 6, §9 "Cross-cutting Health service classification").
    pub tags: Vec<String>,
}

/// Options accepted by `ToolRegistry::execute` (§6).
#[derive(Debug, Clone, Default)]
pub struct ExecuteOpts {
    pub timeout_secs: Option<u64>,
}

/// Opaque callable tool resolved by name (§1 "tools are opaque callables").
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Option<ToolMetadata>;

    async fn execute(
        &self,
        name: &str,
        params: Value,
        owner_id: &str,
        opts: ExecuteOpts,
    ) -> Result<Value, ToolError>;
}

pub const HEALTH_AND_WELLNESS_TAG: &str = "health_and_wellness";

/// A concrete `ToolRegistry` backed by an HTTP RPC endpoint, for deployments
/// that run the tool registry as a separate service rather than linking an
/// in-process implementation (§6 "Tool-registry contract").
pub mod http {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct WireMetadata {
        name: String,
        description: String,
        #[serde(default)]
        parameters_schema: Value,
        #[serde(default)]
        returns_schema: Value,
        #[serde(default)]
        tags: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
    enum WireError {
        Auth(String),
        RateLimit { retry_after_secs: Option<u64> },
        UsageLimit,
        Transient(String),
        Permanent(String),
    }

    /// Calls `{base_url}/tools/{name}` (GET, metadata) and
    /// `{base_url}/tools/{name}/execute` (POST, dispatch). The response body
    /// for a failed execute is `{"error": <WireError>}`; any other non-2xx
    /// status is treated as `ToolError::Transient` so a flaky registry
    /// doesn't masquerade as a permanent tool failure.
    pub struct HttpToolRegistry {
        base_url: String,
        client: reqwest::Client,
    }

    impl HttpToolRegistry {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(60))
                    .build()
                    .expect("failed to build tool-registry HTTP client"),
            }
        }

        fn wire_error_to_tool_error(name: &str, wire: WireError) -> ToolError {
            match wire {
                WireError::Auth(msg) => ToolError::Auth(format!("{name}: {msg}")),
                WireError::RateLimit { retry_after_secs } => {
                    ToolError::RateLimit(name.to_string(), retry_after_secs)
                }
                WireError::UsageLimit => ToolError::UsageLimit(name.to_string()),
                WireError::Transient(msg) => ToolError::Transient(name.to_string(), msg),
                WireError::Permanent(msg) => ToolError::Permanent(name.to_string(), msg),
            }
        }
    }

    #[async_trait]
    impl ToolRegistry for HttpToolRegistry {
        async fn get_by_name(&self, name: &str) -> Option<ToolMetadata> {
            let url = format!("{}/tools/{name}", self.base_url);
            let resp = self.client.get(&url).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let wire: WireMetadata = resp.json().await.ok()?;
            Some(ToolMetadata {
                name: wire.name,
                description: wire.description,
                parameters_schema: wire.parameters_schema,
                returns_schema: wire.returns_schema,
                tags: wire.tags,
            })
        }

        async fn execute(
            &self,
            name: &str,
            params: Value,
            owner_id: &str,
            opts: ExecuteOpts,
        ) -> Result<Value, ToolError> {
            let url = format!("{}/tools/{name}/execute", self.base_url);
            let mut request = self
                .client
                .post(&url)
                .json(&serde_json::json!({"params": params, "owner_id": owner_id}));
            if let Some(timeout_secs) = opts.timeout_secs {
                request = request.timeout(Duration::from_secs(timeout_secs));
            }

            let resp = request
                .send()
                .await
                .map_err(|e| ToolError::Transient(name.to_string(), e.to_string()))?;

            if resp.status().is_success() {
                resp.json::<Value>()
                    .await
                    .map_err(|e| ToolError::Transient(name.to_string(), format!("invalid response body: {e}")))
            } else {
                let body: Result<serde_json::Value, _> = resp.json().await;
                match body.ok().and_then(|v| v.get("error").cloned()) {
                    Some(raw) => match serde_json::from_value::<WireError>(raw) {
                        Ok(wire) => Err(Self::wire_error_to_tool_error(name, wire)),
                        Err(_) => Err(ToolError::Transient(name.to_string(), "malformed error body".to_string())),
                    },
                    None => Err(ToolError::Transient(name.to_string(), "registry returned an error with no body".to_string())),
                }
            }
        }
    }
}
