//! End-to-end HTTP surface tests (§6): binds the real Axum router behind a
//! loopback TCP listener and drives it with `reqwest`, the same pattern the
//! teacher daemon's `tests/health.rs` uses for its IPC server.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use triggerd::automations::model::{Action, TriggerType};
use triggerd::config::EngineConfig;
use triggerd::credentials::{Credential, CredentialError, CredentialStore};
use triggerd::notifications::NoopNotificationHandler;
use triggerd::storage::Storage;
use triggerd::tools::{ExecuteOpts, ToolError, ToolMetadata, ToolRegistry};
use triggerd::AppContext;

struct EchoToolRegistry;

#[async_trait]
impl ToolRegistry for EchoToolRegistry {
    async fn get_by_name(&self, name: &str) -> Option<ToolMetadata> {
        Some(ToolMetadata {
            name: name.to_string(),
            description: String::new(),
            parameters_schema: Value::Null,
            returns_schema: Value::Null,
            tags: Vec::new(),
        })
    }

    async fn execute(&self, _name: &str, params: Value, _owner_id: &str, _opts: ExecuteOpts) -> Result<Value, ToolError> {
        Ok(params)
    }
}

struct NoCredentialStore;

#[async_trait]
impl CredentialStore for NoCredentialStore {
    async fn get(&self, owner_id: &str, service: &str) -> Result<Credential, CredentialError> {
        Err(CredentialError::NotFound(owner_id.to_string(), service.to_string()))
    }

    async fn find_by_workspace(&self, _service: &str, _external_workspace_id: &str) -> Result<Vec<Credential>, CredentialError> {
        Ok(Vec::new())
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        Ok(credential.clone())
    }

    async fn store_refreshed(&self, _credential: &Credential) -> Result<(), CredentialError> {
        Ok(())
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn make_test_ctx(dir: &TempDir, port: u16) -> Arc<AppContext> {
    let config = Arc::new(EngineConfig::new(Some(port), Some(dir.path().to_path_buf()), Some("error".to_string())));
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    Arc::new(AppContext::new(
        config,
        storage,
        Arc::new(EchoToolRegistry),
        Arc::new(NoCredentialStore),
        Arc::new(NoopNotificationHandler),
        None,
    ))
}

async fn spawn_server(ctx: Arc<AppContext>, port: u16) {
    let router = triggerd::http::build_router(ctx);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn execute_endpoint_runs_an_active_automation_end_to_end() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;

    let automation = ctx
        .storage
        .create_automation(
            "owner-1",
            "Echo",
            TriggerType::Manual,
            &json!({}),
            &[Action {
                id: "a1".to_string(),
                tool: "echo".to_string(),
                parameters: json!({"greeting": "{{subject}}"}),
                output_as: None,
                condition: None,
                timeout_secs: None,
            }],
        )
        .await
        .unwrap();
    ctx.storage
        .update_status(&automation.id, triggerd::automations::model::AutomationStatus::Active)
        .await
        .unwrap();

    spawn_server(ctx.clone(), port).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/execute"))
        .json(&json!({"automation_id": automation.id, "trigger_data": {"subject": "hello"}}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["actions_executed"], 1);
    assert_eq!(body["action_results"][0]["output"]["greeting"], "hello");
}

#[tokio::test]
async fn execute_endpoint_rejects_inactive_automation() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;

    let automation = ctx
        .storage
        .create_automation("owner-1", "Paused", TriggerType::Manual, &json!({}), &[])
        .await
        .unwrap();
    // left in pending_review — never promoted to active.

    spawn_server(ctx.clone(), port).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/execute"))
        .json(&json!({"automation_id": automation.id, "trigger_data": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn webhook_slack_handshake_is_answered_without_touching_storage() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;
    spawn_server(ctx, port).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/webhooks/slack"))
        .json(&json!({"type": "url_verification", "challenge": "abc123"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert_eq!(body, "abc123");
}

#[tokio::test]
async fn scheduler_trigger_endpoint_rejects_unknown_automation() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;
    spawn_server(ctx, port).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://127.0.0.1:{port}/scheduler/trigger"))
        .json(&json!({"automation_id": "does-not-exist"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}
