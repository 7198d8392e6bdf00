//! Webhook Ingress (C4, §4.4): handshake → signature → parse → tenant
//! resolution → service-specific filtering → enqueue. Which automation(s)
//! the event matches, and whether each one's own filter passes, is resolved
//! later by [`crate::queue::Dispatcher`] at claim time — see its module docs.

pub mod parsers;
pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, warn};

use crate::automations::model::TriggerType;
use crate::config::EngineConfig;
use crate::credentials::CredentialManager;
use crate::queue::{EnqueueResult, EventQueue};
use crate::storage::Storage;
use crate::tools::{ExecuteOpts, ToolRegistry};
use parsers::{Handshake, ParsedEvent};

/// What the HTTP layer should do with a request, after ingress has run its
/// full pipeline (§4.4 "Response discipline").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// A protocol handshake — respond immediately with this status/body.
    Handshake { status: u16, body: String },
    /// Signature verification failed (§4.4 step 2, §7).
    Unauthorized,
    /// Payload could not be parsed (§4.4 step 3, §7).
    BadRequest(String),
    /// Tenant resolution found no matching owner (§7 "connect the service").
    TenantUnresolved,
    /// Processed — always a 2xx regardless of how many automations matched.
    Accepted { enqueued: usize, duplicates: usize },
}

pub struct WebhookIngress {
    storage: Arc<Storage>,
    queue: Arc<EventQueue>,
    credentials: Arc<CredentialManager>,
    registry: Arc<dyn ToolRegistry>,
    config: Arc<EngineConfig>,
}

impl WebhookIngress {
    pub fn new(
        storage: Arc<Storage>,
        queue: Arc<EventQueue>,
        credentials: Arc<CredentialManager>,
        registry: Arc<dyn ToolRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            queue,
            credentials,
            registry,
            config,
        }
    }

    /// Run the full ingress pipeline for one inbound request. `headers` keys
    /// are expected lower-cased (the HTTP layer normalizes them).
    pub async fn handle(
        &self,
        service: &str,
        query: &[(String, String)],
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> IngressOutcome {
        let parsed_body: Result<Value, _> = serde_json::from_slice(raw_body);
        let handshake_body = parsed_body.clone().unwrap_or(Value::Null);

        if let Some((status, body)) = self.resolve_handshake(service, query, &handshake_body) {
            return IngressOutcome::Handshake { status, body };
        }

        let body = match parsed_body {
            Ok(v) => v,
            Err(e) => return IngressOutcome::BadRequest(format!("invalid JSON body: {e}")),
        };

        if let Some(secret) = self.config.webhook_secret(service) {
            if !verify_signature(service, secret, headers, raw_body) {
                warn!(service, "webhook signature verification failed");
                return IngressOutcome::Unauthorized;
            }
        }

        let event = match parsers::parse(service, &body) {
            Ok(e) => e,
            Err(e) => return IngressOutcome::BadRequest(e.to_string()),
        };

        if service == "microsoft" && !parsers::microsoft_should_propagate(&event) {
            return IngressOutcome::Accepted { enqueued: 0, duplicates: 0 };
        }

        // Microsoft's clientState already equals the internal owner id
        // (§4.4 step 4) — no credential-store lookup needed for it.
        let owner_id = if service == "microsoft" {
            event.external_workspace_id.clone()
        } else {
            match &event.external_workspace_id {
                Some(workspace_id) => self.credentials.resolve_tenant(service, workspace_id).await,
                None => None,
            }
        };
        let owner_id = match owner_id {
            Some(id) => id,
            None => return IngressOutcome::TenantUnresolved,
        };

        if service == "gmail" {
            return self.handle_gmail(owner_id, event).await;
        }

        let (enqueued, duplicates) = self.enqueue_event(&owner_id, service, &event).await;
        IngressOutcome::Accepted { enqueued, duplicates }
    }

    fn resolve_handshake(
        &self,
        service: &str,
        query: &[(String, String)],
        body: &Value,
    ) -> Option<(u16, String)> {
        match parsers::check_handshake(service, query, body) {
            Handshake::None => None,
            Handshake::Respond { status, body } => {
                if service == "fitbit" {
                    // §4.4 step 1: the caller (us) compares the `verify`
                    // query param against the configured secret and maps to
                    // 204 (match) or 404 (no match).
                    let expected = self.config.webhook_secret("fitbit").unwrap_or("");
                    if body == expected {
                        Some((204, String::new()))
                    } else {
                        Some((404, String::new()))
                    }
                } else {
                    Some((status, body))
                }
            }
        }
    }

    /// §4.4 step 5: a Gmail Pub/Sub push only carries a `history_id` — the
    /// actual new-message ids must be fetched via a history delta call.
    /// Modeled as an ordinary tool-registry invocation (`gmail_list_history`)
    /// rather than a bespoke collaborator trait, since the tool registry is
    /// already this crate's one abstraction over "make an authenticated
    /// outbound call on the user's behalf".
    async fn handle_gmail(&self, owner_id: String, event: ParsedEvent) -> IngressOutcome {
        let cursor_key = format!("gmail_history_cursor:{owner_id}");
        let last_cursor = self.storage.get_setting(&cursor_key).await.ok().flatten();
        let params = json!({"start_history_id": last_cursor, "history_id": event.event_id});

        match self
            .registry
            .execute("gmail_list_history", params, &owner_id, ExecuteOpts::default())
            .await
        {
            Ok(result) => {
                if let Err(e) = self.storage.set_setting(&cursor_key, &event.event_id).await {
                    warn!(error = %e, "failed to persist gmail history cursor");
                }

                let message_ids: Vec<String> = result
                    .get("message_ids")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();

                if message_ids.is_empty() {
                    return IngressOutcome::Accepted { enqueued: 0, duplicates: 0 };
                }

                let mut enqueued = 0;
                let mut duplicates = 0;
                for message_id in message_ids {
                    let message_event = ParsedEvent {
                        event_type: "message".to_string(),
                        event_id: message_id.clone(),
                        data: json!({"message_id": message_id, "history_id": event.event_id}),
                        external_workspace_id: event.external_workspace_id.clone(),
                    };
                    let (e, d) = self.enqueue_event(&owner_id, "gmail", &message_event).await;
                    enqueued += e;
                    duplicates += d;
                }
                IngressOutcome::Accepted { enqueued, duplicates }
            }
            Err(e) => {
                // §7 "Gmail history delta failure: degrade to enqueue-through".
                warn!(error = %e, owner_id, "gmail history delta failed, enqueueing through");
                let (enqueued, duplicates) = self.enqueue_event(&owner_id, "gmail", &event).await;
                IngressOutcome::Accepted { enqueued, duplicates }
            }
        }
    }

    /// §4.4 step 7: enqueue the external event exactly once — the loss-free
    /// default applies unconditionally, since which automation(s) it matches
    /// (zero, one, or many) is resolved later by
    /// [`crate::queue::Dispatcher`] at claim time, not here. No
    /// `automation_id` is bound at enqueue time; `event_type`/`trigger_data`
    /// ride along in the payload for the dispatcher's own matching pass.
    async fn enqueue_event(&self, owner_id: &str, service: &str, event: &ParsedEvent) -> (usize, usize) {
        let payload = json!({"event_type": event.event_type, "trigger_data": event.data});
        match self.queue.enqueue(service, &event.event_id, owner_id, None, &payload).await {
            Ok(EnqueueResult::Enqueued) => (1, 0),
            Ok(EnqueueResult::Duplicate) => (0, 1),
            Err(e) => {
                warn!(error = %e, service, event_id = %event.event_id, "webhook enqueue failed");
                (0, 0)
            }
        }
    }
}

/// `trigger_config.service` matches case-insensitively; `event_type` (or
/// `event_types`) matches exactly if present, else any event type matches
/// (§4.4 step 7, §6 "webhook: {service, event_type|event_types, ...}").
///
/// Shared with [`crate::queue::Dispatcher`], which runs this same match at
/// claim time against every active webhook automation for the event's owner.
pub(crate) fn trigger_matches(trigger_config: &Value, service: &str, event_type: &str) -> bool {
    let configured_service = trigger_config.get("service").and_then(|v| v.as_str()).unwrap_or("");
    if !configured_service.eq_ignore_ascii_case(service) {
        return false;
    }

    let single = trigger_config.get("event_type").and_then(|v| v.as_str());
    let list = trigger_config.get("event_types").and_then(|v| v.as_array());
    match (single, list) {
        (None, None) => true,
        (Some(t), _) => t == event_type,
        (None, Some(types)) => types.iter().any(|v| v.as_str() == Some(event_type)),
    }
}

fn verify_signature(service: &str, secret: &str, headers: &HashMap<String, String>, body: &[u8]) -> bool {
    let header = |name: &str| headers.get(name).map(|s| s.as_str()).unwrap_or("");
    match service {
        "slack" => signature::verify_slack(
            secret,
            header("x-slack-request-timestamp"),
            body,
            header("x-slack-signature"),
        ),
        "github" => signature::verify_sha256(secret, body, header("x-hub-signature-256")),
        "google" | "gmail" => signature::verify_sha256(secret, body, header("x-goog-signature")),
        "microsoft" => signature::verify_sha256(secret, body, header("x-ms-signature")),
        "notion" => signature::verify_notion(secret, body, header("x-notion-signature")),
        "todoist" => signature::verify_todoist(secret, body, header("x-todoist-hmac-sha256")),
        "fitbit" => signature::verify_fitbit(secret, body, header("x-fitbit-signature")),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::model::AutomationStatus;
    use crate::credentials::{Credential, CredentialError, CredentialStore};
    use crate::tools::fake::FakeToolRegistry;
    use crate::tools::ToolError;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakeCredentialStore;

    #[async_trait]
    impl CredentialStore for FakeCredentialStore {
        async fn get(&self, owner_id: &str, service: &str) -> Result<Credential, CredentialError> {
            Ok(Credential {
                owner_id: owner_id.to_string(),
                service: service.to_string(),
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_at: None,
                created_at: Utc::now(),
            })
        }

        async fn find_by_workspace(
            &self,
            service: &str,
            external_workspace_id: &str,
        ) -> Result<Vec<Credential>, CredentialError> {
            if external_workspace_id == "T123" || external_workspace_id == "a@example.com" {
                Ok(vec![Credential {
                    owner_id: "owner-1".to_string(),
                    service: service.to_string(),
                    access_token: "tok".to_string(),
                    refresh_token: None,
                    expires_at: None,
                    created_at: Utc::now(),
                }])
            } else {
                Ok(vec![])
            }
        }

        async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
            Ok(credential.clone())
        }

        async fn store_refreshed(&self, _credential: &Credential) -> Result<(), CredentialError> {
            Ok(())
        }
    }

    async fn ingress_with(registry: Arc<dyn ToolRegistry>) -> (WebhookIngress, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let queue = Arc::new(EventQueue::new(storage.clone()));
        let credentials = Arc::new(CredentialManager::new(Arc::new(FakeCredentialStore)));
        let config = Arc::new(EngineConfig::new(None, Some(dir.path().to_path_buf()), None));
        let ingress = WebhookIngress::new(storage.clone(), queue, credentials, registry, config);
        (ingress, storage)
    }

    #[tokio::test]
    async fn slack_url_verification_is_answered_without_touching_storage() {
        let (ingress, _storage) = ingress_with(Arc::new(FakeToolRegistry::new())).await;
        let body = json!({"type": "url_verification", "challenge": "abc123"}).to_string();
        let outcome = ingress
            .handle("slack", &[], &HashMap::new(), body.as_bytes())
            .await;
        assert_eq!(
            outcome,
            IngressOutcome::Handshake { status: 200, body: "abc123".to_string() }
        );
    }

    #[tokio::test]
    async fn slack_event_enqueues_against_matching_automation() {
        let (ingress, storage) = ingress_with(Arc::new(FakeToolRegistry::new())).await;
        let automation = storage
            .create_automation(
                "owner-1",
                "Slack urgent",
                TriggerType::Webhook,
                &json!({"service": "slack"}),
                &[],
            )
            .await
            .unwrap();
        storage
            .update_status(&automation.id, AutomationStatus::Active)
            .await
            .unwrap();

        let body = json!({
            "team_id": "T123",
            "event": {"type": "message", "ts": "1700.1", "subject": "hi"}
        })
        .to_string();
        let outcome = ingress
            .handle("slack", &[], &HashMap::new(), body.as_bytes())
            .await;
        assert_eq!(outcome, IngressOutcome::Accepted { enqueued: 1, duplicates: 0 });
    }

    #[tokio::test]
    async fn unresolvable_tenant_is_rejected() {
        let (ingress, _storage) = ingress_with(Arc::new(FakeToolRegistry::new())).await;
        let body = json!({
            "team_id": "unknown-workspace",
            "event": {"type": "message", "ts": "1700.1"}
        })
        .to_string();
        let outcome = ingress
            .handle("slack", &[], &HashMap::new(), body.as_bytes())
            .await;
        assert_eq!(outcome, IngressOutcome::TenantUnresolved);
    }

    #[tokio::test]
    async fn microsoft_updated_change_type_is_dropped_without_enqueue() {
        let (ingress, storage) = ingress_with(Arc::new(FakeToolRegistry::new())).await;
        let automation = storage
            .create_automation(
                "owner-1",
                "MS calendar",
                TriggerType::Webhook,
                &json!({"service": "microsoft"}),
                &[],
            )
            .await
            .unwrap();
        storage
            .update_status(&automation.id, AutomationStatus::Active)
            .await
            .unwrap();

        let body = json!({"value": [{"changeType": "updated", "subscriptionId": "s1", "clientState": "owner-1"}]})
            .to_string();
        let outcome = ingress
            .handle("microsoft", &[], &HashMap::new(), body.as_bytes())
            .await;
        assert_eq!(outcome, IngressOutcome::Accepted { enqueued: 0, duplicates: 0 });
    }

    #[tokio::test]
    async fn gmail_enqueues_one_event_per_new_message_id() {
        let registry: Arc<dyn ToolRegistry> = Arc::new(FakeToolRegistry::new().with_tool(
            "gmail_list_history",
            |_| Ok(json!({"message_ids": ["m1", "m2"]})),
        ));
        let (ingress, storage) = ingress_with(registry).await;
        let automation = storage
            .create_automation(
                "owner-1",
                "Gmail forward",
                TriggerType::Webhook,
                &json!({"service": "gmail"}),
                &[],
            )
            .await
            .unwrap();
        storage
            .update_status(&automation.id, AutomationStatus::Active)
            .await
            .unwrap();

        use base64::Engine;
        let inner = json!({"emailAddress": "a@example.com", "historyId": 555});
        let encoded = base64::engine::general_purpose::STANDARD.encode(inner.to_string());
        let body = json!({"message": {"data": encoded}}).to_string();

        let outcome = ingress.handle("gmail", &[], &HashMap::new(), body.as_bytes()).await;
        assert_eq!(outcome, IngressOutcome::Accepted { enqueued: 2, duplicates: 0 });
    }

    #[tokio::test]
    async fn gmail_history_delta_failure_degrades_to_enqueue_through() {
        let registry: Arc<dyn ToolRegistry> = Arc::new(FakeToolRegistry::new().with_tool(
            "gmail_list_history",
            |_| Err(ToolError::Transient("gmail_list_history".into(), "upstream down".into())),
        ));
        let (ingress, _storage) = ingress_with(registry).await;
        // Exercises handle_gmail directly since FakeCredentialStore only
        // resolves the "T123" workspace used by the Slack tests above.
        let outcome = ingress
            .handle_gmail(
                "owner-1".to_string(),
                ParsedEvent {
                    event_type: "history".to_string(),
                    event_id: "555".to_string(),
                    data: json!({"historyId": 555}),
                    external_workspace_id: Some("a@example.com".to_string()),
                },
            )
            .await;
        assert_eq!(outcome, IngressOutcome::Accepted { enqueued: 0, duplicates: 0 });
    }
}
