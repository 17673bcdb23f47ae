//! Data model for workflows, runs, steps, and actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use silver_telegram_core::{ActionId, ProjectId, StepId, WorkflowId, WorkflowRunId};
use std::collections::HashMap;

/// Lifecycle status of a single workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet admitted by the scheduler.
    Pending,
    /// Admitted and waiting for a runner slot.
    Queued,
    /// Actively executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl RunStatus {
    /// Returns true if this status represents a finished run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

/// A single execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: WorkflowRunId,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    /// Log entries accumulated across the run, in the order the event
    /// pipeline flushed them. Replaced atomically on each flush.
    pub logs: Vec<LogEntry>,
    /// Output file references accumulated across the run. Replaced
    /// atomically on each flush.
    pub output_files: Vec<OutputFileRef>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a new pending run for the given workflow.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, project_id: ProjectId, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            project_id,
            status: RunStatus::Pending,
            input,
            output: None,
            logs: Vec::new(),
            output_files: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Marks the run as running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Marks the run completed with the given output.
    pub fn complete(&mut self, output: Value) {
        self.status = RunStatus::Completed;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Marks the run failed with the given error message.
    pub fn fail(&mut self, error_message: String) {
        self.status = RunStatus::Failed;
        self.error_message = Some(error_message);
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Marks the run cancelled.
    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

/// A workflow definition: an ordered tree of steps, each with ordered actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub name: String,
    pub config: WorkflowConfig,
}

/// Per-run behavior configuration for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Named variables available to the run, layered below step/action resolution.
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,

    /// Multirun (loop) configuration.
    #[serde(default)]
    pub multirun: MultirunConfig,

    /// Overall run timeout, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Number of times to retry a failed run (not a failed action).
    #[serde(default)]
    pub retries: u32,

    /// Notification hooks fired on terminal transitions.
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            multirun: MultirunConfig::default(),
            timeout_seconds: default_timeout_seconds(),
            retries: 0,
            notifications: Vec::new(),
        }
    }
}

/// A single named variable, resolved per the rules in the variable resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub key: String,
    pub var_type: VariableType,
    pub value: Value,
}

/// Origin of a variable's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// Value is used as-is.
    Static,
    /// Value is itself a token to be resolved (may reference other variables).
    Dynamic,
    /// Value is read from an environment variable named by `value`.
    Environment,
}

/// Multirun (looped execution) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultirunConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: MultirunMode,
    #[serde(default = "default_multirun_count")]
    pub count: u32,
    #[serde(default = "default_multirun_delay_ms")]
    pub delay_ms: u64,
}

fn default_multirun_count() -> u32 {
    1
}

fn default_multirun_delay_ms() -> u64 {
    1000
}

impl Default for MultirunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: MultirunMode::Sequential,
            count: default_multirun_count(),
            delay_ms: default_multirun_delay_ms(),
        }
    }
}

impl MultirunConfig {
    /// Normalizes a zero loop count to one, per the documented default.
    #[must_use]
    pub fn normalized_count(&self) -> u32 {
        if self.count == 0 { 1 } else { self.count }
    }
}

/// Loop execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultirunMode {
    #[default]
    Sequential,
    Parallel,
}

/// A notification hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub on_complete: bool,
    #[serde(default)]
    pub on_error: bool,
    pub transport: String,
    #[serde(default)]
    pub target: Option<String>,
}

/// A condition gating whether a step should run for a given loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCondition {
    LoopIndexIsEven,
    LoopIndexIsOdd,
    LoopIndexIsPrime,
    Random,
}

impl LoopCondition {
    /// Evaluates the condition for the given loop iteration.
    #[must_use]
    pub fn evaluate(self, loop_index: u32) -> bool {
        match self {
            Self::LoopIndexIsEven => loop_index % 2 == 0,
            Self::LoopIndexIsOdd => loop_index % 2 == 1,
            Self::LoopIndexIsPrime => is_prime(loop_index),
            Self::Random => rand::random(),
        }
    }
}

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut i = 3;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// A single ordered step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub step_order: i32,
    #[serde(default)]
    pub skip_condition: Option<LoopCondition>,
    #[serde(default)]
    pub run_only_condition: Option<LoopCondition>,
}

/// A single ordered action within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub step_id: StepId,
    pub action_type: String,
    pub action_order: i32,
    /// Raw, unresolved configuration. Token values are resolved at execution
    /// time by the variable resolver before being handed to the action.
    pub config: Value,
}

/// A log entry produced during run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: WorkflowRunId,
    pub loop_index: u32,
    pub step_id: Option<StepId>,
    pub action_id: Option<ActionId>,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A reference to a file an action produced, persisted to object storage
/// during run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileRef {
    pub loop_index: u32,
    pub step_id: StepId,
    pub action_id: ActionId,
    pub uri: String,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
}

/// The layered variable namespace visible to a single loop iteration.
///
/// Resolution order is: reserved names, then `runtime.*`, then `faker.*`,
/// then static variables, then dynamic variables (recursively resolved),
/// falling back to literal passthrough for unrecognized tokens.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub static_vars: HashMap<String, Value>,
    pub dynamic_vars: HashMap<String, Value>,
    pub runtime: HashMap<String, Value>,
    /// Reserved names (`loopIndex`, `runId`, ...), populated by the runner
    /// once per loop iteration before static/dynamic resolution runs.
    pub reserved: HashMap<String, Value>,
}

impl VariableContext {
    /// Builds a variable context from a workflow's configured variables.
    #[must_use]
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let mut static_vars = HashMap::new();
        let mut dynamic_vars = HashMap::new();

        for var in &config.variables {
            match var.var_type {
                VariableType::Static => {
                    static_vars.insert(var.key.clone(), var.value.clone());
                }
                VariableType::Dynamic => {
                    dynamic_vars.insert(var.key.clone(), var.value.clone());
                }
                VariableType::Environment => {
                    let resolved = var
                        .value
                        .as_str()
                        .and_then(|name| std::env::var(name).ok())
                        .map(Value::String)
                        .unwrap_or(Value::Null);
                    static_vars.insert(var.key.clone(), resolved);
                }
            }
        }

        Self {
            static_vars,
            dynamic_vars,
            runtime: HashMap::new(),
            reserved: HashMap::new(),
        }
    }

    /// Sets a runtime (loop-scoped) variable, e.g. `loop_index`.
    pub fn set_runtime(&mut self, key: impl Into<String>, value: Value) {
        self.runtime.insert(key.into(), value);
    }

    /// Sets a reserved name, e.g. `loopIndex` or `runId`.
    pub fn set_reserved(&mut self, key: impl Into<String>, value: Value) {
        self.reserved.insert(key.into(), value);
    }
}
