//! Notification dispatch on run completion.
//!
//! Delivery (email, webhook, chat) is external to this crate; `Notifier` is
//! the seam a concrete transport plugs into. Dispatch failures are logged by
//! the caller and never affect the run's recorded outcome.

use async_trait::async_trait;
use silver_telegram_workflow::{NotificationConfig, Run};
use std::sync::Mutex;

/// Fires configured notification hooks when a run reaches a terminal state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run: &Run, config: &NotificationConfig);
}

/// A notifier that drops everything. Used when no transport is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _run: &Run, _config: &NotificationConfig) {}
}

/// A notifier that records calls in memory, for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(silver_telegram_core::WorkflowRunId, String)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(silver_telegram_core::WorkflowRunId, String)> {
        self.calls.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, run: &Run, config: &NotificationConfig) {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push((run.id, config.transport.clone()));
    }
}

/// Dispatches notifications for every configured hook whose `on_complete` /
/// `on_error` flag matches the run's outcome.
pub async fn dispatch_notifications(notifier: &dyn Notifier, run: &Run, configs: &[NotificationConfig]) {
    let succeeded = run.status == silver_telegram_workflow::RunStatus::Completed;
    for config in configs {
        let should_fire = (succeeded && config.on_complete) || (!succeeded && config.on_error);
        if should_fire {
            notifier.notify(run, config).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use silver_telegram_core::{ProjectId, WorkflowId};

    #[tokio::test]
    async fn fires_on_complete_hook_for_completed_run() {
        let notifier = RecordingNotifier::new();
        let mut run = Run::new(WorkflowId::new(), ProjectId::new(), Value::Null);
        run.complete(Value::Null);

        let configs = vec![NotificationConfig {
            on_complete: true,
            on_error: false,
            transport: "webhook".to_string(),
            target: None,
        }];

        dispatch_notifications(&notifier, &run, &configs).await;
        assert_eq!(notifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn skips_on_error_hook_for_completed_run() {
        let notifier = RecordingNotifier::new();
        let mut run = Run::new(WorkflowId::new(), ProjectId::new(), Value::Null);
        run.complete(Value::Null);

        let configs = vec![NotificationConfig {
            on_complete: false,
            on_error: true,
            transport: "email".to_string(),
            target: None,
        }];

        dispatch_notifications(&notifier, &run, &configs).await;
        assert!(notifier.calls().is_empty());
    }
}
