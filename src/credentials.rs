//! OAuth credential store — an external collaborator (§1, §5 "OAuth token
//! refresh"). This crate owns the *refresh policy* (lazy refresh within a
//! 5-minute expiry buffer, serialized per `(owner, service)`) but treats the
//! store itself, and the refresh RPC, as someone else's interface.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

/// A resolved credential row (§4.4 step 4: multi-tenant resolution also
/// reads `owner_id`/`created_at` off this to pick the oldest match).
#[derive(Debug, Clone)]
pub struct Credential {
    pub owner_id: String,
    pub service: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// §5: refresh lazily when `expires_at` is within a 5-minute buffer.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp - now < Duration::minutes(5),
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential for owner {0} / service {1}")]
    NotFound(String, String),
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
}

/// External collaborator interface (§6): storage + the refresh RPC. The
/// refresh RPC itself is out of scope (§1) — only its call shape and the
/// policy wrapping it belong to this crate.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, owner_id: &str, service: &str) -> Result<Credential, CredentialError>;

    /// All credential rows for a given service + external workspace id,
    /// used for multi-tenant resolution (§4.4 step 4, §9 "pick the oldest
    /// deterministically").
    async fn find_by_workspace(
        &self,
        service: &str,
        external_workspace_id: &str,
    ) -> Result<Vec<Credential>, CredentialError>;

    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError>;

    async fn store_refreshed(&self, credential: &Credential) -> Result<(), CredentialError>;
}

/// Wraps a `CredentialStore` with the refresh policy from §5: a per-`(owner,
/// service)` mutex so two concurrent expired-token discoveries don't race to
/// refresh (double-checked expiry inside the lock).
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refresh_locks: DashMap<(String, String), Arc<AsyncMutex<()>>>,
    /// One breaker per service, shared across owners — a flapping OAuth
    /// provider shouldn't eat every automation's action timeout budget
    /// while it recovers.
    refresh_breakers: DashMap<String, CircuitBreaker>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            refresh_locks: DashMap::new(),
            refresh_breakers: DashMap::new(),
        }
    }

    fn breaker_for(&self, service: &str) -> CircuitBreaker {
        self.refresh_breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(format!("oauth-refresh:{service}"), CircuitBreakerConfig::default())
            })
            .clone()
    }

    fn lock_for(&self, owner_id: &str, service: &str) -> Arc<AsyncMutex<()>> {
        self.refresh_locks
            .entry((owner_id.to_string(), service.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Fetch a credential, refreshing it first if it's within the expiry
    /// buffer. A refresh failure does not block dispatch (§5, §7): the
    /// stale credential is returned so the downstream tool call surfaces a
    /// clear auth error instead of the automation silently stalling.
    pub async fn get(&self, owner_id: &str, service: &str) -> Result<Credential, CredentialError> {
        let credential = self.store.get(owner_id, service).await?;
        if !credential.needs_refresh(Utc::now()) {
            return Ok(credential);
        }

        let lock = self.lock_for(owner_id, service);
        let _guard = lock.lock().await;

        // Double-checked: another task may have refreshed while we waited.
        let credential = self.store.get(owner_id, service).await?;
        if !credential.needs_refresh(Utc::now()) {
            return Ok(credential);
        }

        let breaker = self.breaker_for(service);
        if !breaker.is_allowed().await {
            warn!(owner_id, service, "oauth refresh circuit open, passing through stale token");
            return Ok(credential);
        }

        match self.store.refresh(&credential).await {
            Ok(refreshed) => {
                breaker.record_success().await;
                self.store.store_refreshed(&refreshed).await?;
                Ok(refreshed)
            }
            Err(e) => {
                breaker.record_failure().await;
                warn!(owner_id, service, error = %e, "oauth refresh failed, passing through stale token");
                Ok(credential)
            }
        }
    }

    /// Resolve an external workspace id to an internal owner id, picking the
    /// oldest credential row when the workspace is shared across owners
    /// (§4.4 step 4, §9).
    pub async fn resolve_tenant(
        &self,
        service: &str,
        external_workspace_id: &str,
    ) -> Option<String> {
        let mut rows = self
            .store
            .find_by_workspace(service, external_workspace_id)
            .await
            .ok()?;
        rows.sort_by_key(|c| c.created_at);
        rows.into_iter().next().map(|c| c.owner_id)
    }
}

/// A concrete `CredentialStore` backed by an HTTP RPC endpoint — the OAuth
/// credential store is an external collaborator (§1) this crate only ever
/// calls, never implements.
pub mod http {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct WireCredential {
        owner_id: String,
        service: String,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    }

    impl From<WireCredential> for Credential {
        fn from(w: WireCredential) -> Self {
            Credential {
                owner_id: w.owner_id,
                service: w.service,
                access_token: w.access_token,
                refresh_token: w.refresh_token,
                expires_at: w.expires_at,
                created_at: w.created_at,
            }
        }
    }

    pub struct HttpCredentialStore {
        base_url: String,
        client: reqwest::Client,
    }

    impl HttpCredentialStore {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                    .expect("failed to build credential-store HTTP client"),
            }
        }
    }

    #[async_trait]
    impl CredentialStore for HttpCredentialStore {
        async fn get(&self, owner_id: &str, service: &str) -> Result<Credential, CredentialError> {
            let url = format!("{}/credentials/{owner_id}/{service}", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| CredentialError::NotFound(owner_id.to_string(), format!("{service}: {e}")))?;
            if !resp.status().is_success() {
                return Err(CredentialError::NotFound(owner_id.to_string(), service.to_string()));
            }
            resp.json::<WireCredential>()
                .await
                .map(Credential::from)
                .map_err(|e| CredentialError::NotFound(owner_id.to_string(), format!("{service}: {e}")))
        }

        async fn find_by_workspace(
            &self,
            service: &str,
            external_workspace_id: &str,
        ) -> Result<Vec<Credential>, CredentialError> {
            let url = format!("{}/credentials/by-workspace/{service}/{external_workspace_id}", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| CredentialError::NotFound(external_workspace_id.to_string(), e.to_string()))?;
            if !resp.status().is_success() {
                return Ok(Vec::new());
            }
            let wire: Vec<WireCredential> = resp
                .json()
                .await
                .map_err(|e| CredentialError::NotFound(external_workspace_id.to_string(), e.to_string()))?;
            Ok(wire.into_iter().map(Credential::from).collect())
        }

        async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
            let url = format!("{}/credentials/{}/{}/refresh", self.base_url, credential.owner_id, credential.service);
            let resp = self
                .client
                .post(&url)
                .json(&serde_json::json!({"refresh_token": credential.refresh_token}))
                .send()
                .await
                .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(CredentialError::RefreshFailed(format!("registry returned {}", resp.status())));
            }
            resp.json::<WireCredential>()
                .await
                .map(Credential::from)
                .map_err(|e| CredentialError::RefreshFailed(e.to_string()))
        }

        async fn store_refreshed(&self, credential: &Credential) -> Result<(), CredentialError> {
            let url = format!("{}/credentials/{}/{}", self.base_url, credential.owner_id, credential.service);
            let resp = self
                .client
                .put(&url)
                .json(&serde_json::json!({
                    "access_token": credential.access_token,
                    "refresh_token": credential.refresh_token,
                    "expires_at": credential.expires_at,
                }))
                .send()
                .await
                .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(CredentialError::RefreshFailed(format!("registry returned {}", resp.status())))
            }
        }
    }
}
