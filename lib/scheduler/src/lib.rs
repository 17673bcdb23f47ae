//! Scheduling and execution for workflow runs.
//!
//! This crate provides:
//!
//! - **Repository**: persistence for runs and workflow definitions
//! - **Cache**: fast shared state for run status and admission bookkeeping
//! - **Runner**: executes a single run's multirun loops, steps, and actions
//! - **Scheduler**: the admission loop that bounds concurrent execution and
//!   owns each run's terminal-state transition
//! - **Notifier**: fires configured hooks when a run reaches a terminal state

pub mod cache;
pub mod error;
pub mod notifier;
pub mod repository;
pub mod runner;
pub mod scheduler;

pub use cache::{CachedStatus, InMemoryRunCache, NatsRunCache, RunCache};
pub use error::{CacheError, RepositoryError, RunnerError, SchedulerError};
pub use notifier::{dispatch_notifications, NullNotifier, Notifier, RecordingNotifier};
pub use repository::{InMemoryRunRepository, PostgresRunRepository, RunRepository};
pub use runner::{BrowserSessionFactory, NullBrowserSessionFactory, Runner, StepWithActions};
pub use scheduler::{Scheduler, SchedulerConfig};
