pub mod automations;
pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod http;
pub mod notifications;
pub mod poller;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod tools;
pub mod value;
pub mod webhook;

use std::sync::Arc;

use config::EngineConfig;
use credentials::CredentialManager;
use engine::ActionExecutor;
use notifications::NotificationHandler;
use poller::Poller;
use queue::{Dispatcher, EventQueue, OwnerIdOnlyResolver, UserResolver};
use scheduler::Scheduler;
use storage::Storage;
use tools::ToolRegistry;
use webhook::WebhookIngress;

/// Shared application state handed to every HTTP handler and background
/// loop — the wiring of C1-C6 described in §2 ("Data flow").
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EngineConfig>,
    pub storage: Arc<Storage>,
    pub queue: Arc<EventQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingress: Arc<WebhookIngress>,
    pub poller: Arc<Poller>,
    pub scheduler: Arc<Scheduler>,
    pub credentials: Arc<CredentialManager>,
}

impl AppContext {
    /// Wire the queue, executor, ingress, poller, scheduler and dispatcher
    /// around a shared `Storage` handle. `user_resolver` lets a deployment
    /// plug in a real user directory; defaults to `OwnerIdOnlyResolver`
    /// when none is given (§4.3 "Resolution of a user's profile ... is
    /// left to the caller").
    pub fn new(
        config: Arc<EngineConfig>,
        storage: Arc<Storage>,
        registry: Arc<dyn ToolRegistry>,
        credential_store: Arc<dyn credentials::CredentialStore>,
        notifications: Arc<dyn NotificationHandler>,
        user_resolver: Option<Arc<dyn UserResolver>>,
    ) -> Self {
        let queue = Arc::new(EventQueue::new(storage.clone()));
        let executor = Arc::new(ActionExecutor::new(registry.clone(), notifications));
        let user_resolver = user_resolver.unwrap_or_else(|| Arc::new(OwnerIdOnlyResolver));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), executor, user_resolver));
        let credentials = Arc::new(CredentialManager::new(credential_store));

        let ingress = Arc::new(WebhookIngress::new(
            storage.clone(),
            queue.clone(),
            credentials.clone(),
            registry.clone(),
            config.clone(),
        ));
        let poller = Arc::new(Poller::new(
            storage.clone(),
            registry,
            queue.clone(),
            config.poll_batch_size,
            config.default_poll_interval_minutes,
            config.action_timeout_secs,
        ));
        let scheduler = Arc::new(Scheduler::new(storage.clone(), dispatcher.clone()));

        Self {
            config,
            storage,
            queue,
            dispatcher,
            ingress,
            poller,
            scheduler,
            credentials,
        }
    }
}
