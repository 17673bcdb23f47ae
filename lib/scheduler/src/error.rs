//! Error types for the scheduler crate.
//!
//! `RunnerError` is the taxonomy a single run's execution can fail with; its
//! variants drive the scheduler's terminal-state transition deterministically
//! rather than string-matching an error message. `CacheError` and
//! `RepositoryError` are leaf errors from the two storage traits.
//! `SchedulerError` wraps them with admission-loop context.

use silver_telegram_core::{WorkflowId, WorkflowRunId};
use std::fmt;

/// Errors a run can terminate with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// The run, workflow, step, or action referenced does not exist.
    NotFound { message: String },
    /// The workflow configuration is invalid or unparsable.
    Config { message: String },
    /// An action referenced a type with no registered implementation.
    UnknownAction { action_type: String },
    /// An action ran and returned an error.
    ActionFailure { message: String },
    /// The run was cancelled before completion.
    Cancelled,
    /// A transient failure (network, timeout) that a retry might clear.
    Transient { message: String },
    /// A loop iteration panicked.
    Panic { message: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::Config { message } => write!(f, "invalid configuration: {message}"),
            Self::UnknownAction { action_type } => {
                write!(f, "unknown action type: {action_type}")
            }
            Self::ActionFailure { message } => write!(f, "action failed: {message}"),
            Self::Cancelled => write!(f, "run cancelled"),
            Self::Transient { message } => write!(f, "transient error: {message}"),
            Self::Panic { message } => write!(f, "panic during execution: {message}"),
        }
    }
}

impl std::error::Error for RunnerError {}

/// Errors from the run cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Underlying transport (NATS) failure.
    Unavailable { message: String },
    /// An optimistic-concurrency write lost a race and should be retried.
    ConcurrentModification,
    /// Serialization of the cached value failed.
    Serialization { message: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "run cache unavailable: {message}"),
            Self::ConcurrentModification => {
                write!(f, "run cache write lost a concurrent modification race")
            }
            Self::Serialization { message } => {
                write!(f, "run cache serialization error: {message}")
            }
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors from the run/workflow repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Run was not found.
    RunNotFound { id: WorkflowRunId },
    /// Workflow was not found.
    WorkflowNotFound { id: WorkflowId },
    /// Underlying database error.
    Database { message: String },
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { id } => write!(f, "run not found: {id}"),
            Self::WorkflowNotFound { id } => write!(f, "workflow not found: {id}"),
            Self::Database { message } => write!(f, "database error: {message}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// High-level scheduler errors, used to add admission-loop context when
/// wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Admission failed while loading run or workflow state.
    Admission { run_id: WorkflowRunId },
    /// Cancellation was requested for a run with no active handle.
    NoActiveRun { run_id: WorkflowRunId },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission { run_id } => write!(f, "admission failed for run {run_id}"),
            Self::NoActiveRun { run_id } => write!(f, "no active run for {run_id}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_error_display() {
        let err = RunnerError::UnknownAction {
            action_type: "navigate".to_string(),
        };
        assert!(err.to_string().contains("navigate"));
    }

    #[test]
    fn cache_error_display() {
        let err = CacheError::ConcurrentModification;
        assert!(err.to_string().contains("concurrent"));
    }

    #[test]
    fn repository_error_display() {
        let id = WorkflowRunId::new();
        let err = RepositoryError::RunNotFound { id };
        assert!(err.to_string().contains("run not found"));
    }

    #[test]
    fn scheduler_error_display() {
        let id = WorkflowRunId::new();
        let err = SchedulerError::NoActiveRun { run_id: id };
        assert!(err.to_string().contains("no active run"));
    }
}
