//! Notification delivery — out of scope per §1 ("external collaborators
//! with only their interfaces specified"). The executor calls this exactly
//! once, when a tool returns the usage-limit sentinel (§4.2.e).

use async_trait::async_trait;

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn notify_usage_limit_exceeded(&self, owner_id: &str, automation_id: &str, tool: &str);
}

/// No-op handler for deployments (or tests) that don't wire up real
/// delivery.
pub struct NoopNotificationHandler;

#[async_trait]
impl NotificationHandler for NoopNotificationHandler {
    async fn notify_usage_limit_exceeded(&self, _owner_id: &str, _automation_id: &str, _tool: &str) {}
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotificationHandler {
        pub calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl NotificationHandler for RecordingNotificationHandler {
        async fn notify_usage_limit_exceeded(
            &self,
            owner_id: &str,
            automation_id: &str,
            tool: &str,
        ) {
            self.calls.lock().unwrap().push((
                owner_id.to_string(),
                automation_id.to_string(),
                tool.to_string(),
            ));
        }
    }
}
