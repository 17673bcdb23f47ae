//! Action execution: the `Action` trait and the registry that resolves an
//! action's type name to an implementation.

use crate::browser::BrowserSession;
use crate::model::Action as ActionConfig;
use crate::model::{VariableContext, Workflow};
use crate::pipeline::EventPipelineHandle;
use crate::storage::StorageService;
use async_trait::async_trait;
use serde_json::Value;
use silver_telegram_core::{ActionId, StepId, WorkflowRunId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::Span;

/// Errors from action execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The action's configuration failed validation.
    InvalidConfig { message: String },
    /// The action ran but failed.
    ExecutionFailed { message: String },
    /// A dependency external to the runner (network, browser) failed.
    ExternalServiceError { service: String, message: String },
    /// The action timed out.
    Timeout,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { message } => write!(f, "invalid action config: {message}"),
            Self::ExecutionFailed { message } => write!(f, "action execution failed: {message}"),
            Self::ExternalServiceError { service, message } => {
                write!(f, "external service '{service}' error: {message}")
            }
            Self::Timeout => write!(f, "action timed out"),
        }
    }
}

impl std::error::Error for ActionError {}

/// The bundle of context passed to [`Action::execute`].
pub struct RunContext<'a> {
    pub browser_session: &'a dyn BrowserSession,
    pub storage_service: &'a dyn StorageService,
    /// Structured-logging handle scoped to this action's invocation.
    pub logger: Span,
    /// Handle into the event pipeline. Composite actions (conditionals,
    /// loop-until) use this together with `registry` to dispatch and emit
    /// events for nested actions; `parent_action_id` on those events is the
    /// dispatching action's own `action_id`.
    pub event_sink: EventPipelineHandle,
    /// The registry this action was resolved from, available so composite
    /// actions can resolve and dispatch children.
    pub registry: Arc<ActionRegistry>,
    pub run_id: WorkflowRunId,
    pub loop_index: u32,
    pub step_id: StepId,
    pub step_name: &'a str,
    pub action_id: ActionId,
    pub action_type: &'a str,
    pub variable_context: &'a VariableContext,
    pub workflow: &'a Workflow,
}

/// A single action implementation.
///
/// Implementations are resolved by type name through an [`ActionRegistry`]
/// and receive their configuration already resolved of `{{...}}` tokens.
#[async_trait]
pub trait Action: Send + Sync {
    /// Executes the action, returning whatever output it produces.
    async fn execute(&self, config: &Value, ctx: &RunContext<'_>) -> Result<Value, ActionError>;
}

/// Errors from registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No action is registered under this type name.
    UnknownAction { action_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAction { action_type } => {
                write!(f, "unknown action type: {action_type}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Maps action type names to implementations.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action implementation under the given type name,
    /// replacing any existing registration.
    pub fn register(&mut self, action_type: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.insert(action_type.into(), action);
    }

    /// Looks up an action by type name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAction`] if no action is registered
    /// under that name.
    pub fn resolve(&self, action: &ActionConfig) -> Result<Arc<dyn Action>, RegistryError> {
        self.actions
            .get(&action.action_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAction {
                action_type: action.action_type.clone(),
            })
    }
}

/// Echoes the resolved config back as output. Useful in tests and as a
/// no-op placeholder action.
pub struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    async fn execute(&self, config: &Value, _ctx: &RunContext<'_>) -> Result<Value, ActionError> {
        Ok(config.clone())
    }
}

/// Always fails with the given message. Useful in tests.
pub struct FailingAction {
    pub message: String,
}

#[async_trait]
impl Action for FailingAction {
    async fn execute(&self, _config: &Value, _ctx: &RunContext<'_>) -> Result<Value, ActionError> {
        Err(ActionError::ExecutionFailed {
            message: self.message.clone(),
        })
    }
}
