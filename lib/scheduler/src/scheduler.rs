//! Admission and lifecycle management for workflow runs.
//!
//! One [`Scheduler`] task owns the admission loop: it polls the repository
//! for pending runs, admits up to its concurrency limit, and spawns one
//! runner task per admitted run. Each spawned task is solely responsible for
//! writing that run's terminal state; the admission loop never writes to a
//! run it isn't actively admitting, so there is exactly one writer per run
//! at any time.

use silver_telegram_core::{ProjectId, WorkflowRunId};
use silver_telegram_workflow::{
    ActionRegistry, BroadcastRegistry, EventPipeline, EventSink, LogEntry, LogLevel, OutputFileRef,
    RunEvent, StorageService,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CachedStatus, RunCache};
use crate::error::{RunnerError, SchedulerError};
use crate::notifier::{dispatch_notifications, Notifier};
use crate::repository::RunRepository;
use crate::runner::{BrowserSessionFactory, Runner, StepWithActions};

/// Terminal-state cache entries expire after this many seconds, bounding
/// the cache's memory footprint for runs nobody polls again.
const TERMINAL_STATUS_TTL_SECONDS: i64 = 60;

struct ActiveRun {
    cancellation: CancellationToken,
}

/// Configuration for the admission loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_concurrent_runs: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Admits pending runs and tracks the ones currently executing.
pub struct Scheduler {
    config: SchedulerConfig,
    repository: Arc<dyn RunRepository>,
    cache: Arc<dyn RunCache>,
    registry: Arc<ActionRegistry>,
    broadcast: Arc<BroadcastRegistry>,
    notifier: Arc<dyn Notifier>,
    browser_factory: Arc<dyn BrowserSessionFactory>,
    storage: Arc<dyn StorageService>,
    active: Arc<Mutex<HashMap<WorkflowRunId, ActiveRun>>>,
}

impl Scheduler {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn RunRepository>,
        cache: Arc<dyn RunCache>,
        registry: Arc<ActionRegistry>,
        broadcast: Arc<BroadcastRegistry>,
        notifier: Arc<dyn Notifier>,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        storage: Arc<dyn StorageService>,
    ) -> Self {
        Self {
            config,
            repository,
            cache,
            registry,
            broadcast,
            notifier,
            browser_factory,
            storage,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the admission loop until `shutdown` is cancelled. Each iteration
    /// admits as many pending runs as the remaining concurrency budget
    /// allows, then sleeps for `poll_interval`.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            if let Err(e) = self.admit_pending().await {
                warn!(error = %e, "admission pass failed");
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = shutdown.cancelled() => return,
            }
        }
    }

    async fn admit_pending(&self) -> Result<(), RunnerError> {
        let running_count = self.cache.running_count().await.map_err(|e| RunnerError::Transient {
            message: e.to_string(),
        })?;
        if running_count >= self.config.max_concurrent_runs {
            return Ok(());
        }
        let mut budget = self.config.max_concurrent_runs - running_count;

        let pending = self.cache.pending_runs().await.map_err(|e| RunnerError::Transient {
            message: e.to_string(),
        })?;
        if pending.is_empty() {
            return Ok(());
        }

        for run_id in pending {
            if budget == 0 {
                break;
            }
            if self.active.lock().await.contains_key(&run_id) {
                continue;
            }
            if self.admit_one(run_id).await {
                budget -= 1;
            }
        }

        Ok(())
    }

    /// Admits a single run: re-checks its status, transitions it to
    /// running, and spawns its runner task. Returns `false` if the run was
    /// no longer eligible by the time it was loaded (already admitted by a
    /// concurrent pass, or cancelled first).
    async fn admit_one(&self, run_id: WorkflowRunId) -> bool {
        let Ok(mut run) = self.repository.get_run(run_id).await else {
            return false;
        };
        if run.status.is_terminal() || run.status == silver_telegram_workflow::RunStatus::Running {
            return false;
        }

        let Ok(workflow) = self.repository.get_workflow(run.workflow_id).await else {
            return false;
        };
        let Ok(steps) = self.repository.get_steps(workflow.id).await else {
            return false;
        };
        let mut steps_with_actions: Vec<StepWithActions> = Vec::with_capacity(steps.len());
        for step in steps {
            let Ok(actions) = self.repository.get_actions(step.id).await else {
                return false;
            };
            steps_with_actions.push((step, actions));
        }

        run.start();
        if self.repository.update_run(&run).await.is_err() {
            return false;
        }
        let _ = self
            .cache
            .set_status(
                run_id,
                CachedStatus {
                    status: "running".to_string(),
                    error_message: None,
                },
            )
            .await;
        let _ = self.cache.add_running(run_id).await;
        let _ = self.cache.remove_pending(run_id).await;

        let cancellation = CancellationToken::new();
        self.active.lock().await.insert(
            run_id,
            ActiveRun {
                cancellation: cancellation.clone(),
            },
        );

        info!(run_id = %run_id, "admitted run");
        self.spawn_runner(run, workflow, steps_with_actions, cancellation);
        true
    }

    fn spawn_runner(
        &self,
        run: silver_telegram_workflow::Run,
        workflow: silver_telegram_workflow::Workflow,
        steps: Vec<StepWithActions>,
        cancellation: CancellationToken,
    ) {
        let repository = self.repository.clone();
        let cache = self.cache.clone();
        let registry = self.registry.clone();
        let broadcast = self.broadcast.clone();
        let notifier = self.notifier.clone();
        let browser_factory = self.browser_factory.clone();
        let storage = self.storage.clone();
        let active = self.active.clone();

        let (pipeline, handle) = EventPipeline::new();
        let broadcast_for_pipeline = broadcast.clone();
        let log_sink = RunLogSink {
            repository: repository.clone(),
            run_id: run.id,
        };
        tokio::spawn(async move {
            pipeline.run(log_sink, &broadcast_for_pipeline).await;
        });

        tokio::spawn(async move {
            let run_id = run.id;
            let project_id = run.project_id;
            let runner = Runner::new(registry, handle, storage);

            let outcome = runner
                .run(
                    &workflow,
                    &steps,
                    run_id,
                    project_id,
                    browser_factory,
                    cancellation,
                )
                .await;

            let panicked = matches!(outcome, Err(RunnerError::Panic { .. }));

            let mut run = run;
            match outcome {
                Ok(output) => run.complete(output),
                Err(RunnerError::Cancelled) => run.cancel(),
                Err(e) => run.fail(e.to_string()),
            }

            let _ = repository.update_run(&run).await;
            let _ = cache
                .set_status_with_ttl(
                    run_id,
                    CachedStatus {
                        status: format!("{:?}", run.status).to_lowercase(),
                        error_message: run.error_message.clone(),
                    },
                    TERMINAL_STATUS_TTL_SECONDS,
                )
                .await;
            let _ = cache.remove_running(run_id).await;
            active.lock().await.remove(&run_id);
            broadcast.remove((project_id, run.workflow_id, run_id));

            dispatch_notifications(notifier.as_ref(), &run, &workflow.config.notifications).await;

            // The run is recorded failed above; re-raise so the task itself
            // reports a panic rather than quietly returning an error.
            if panicked {
                let message = run.error_message.clone().unwrap_or_default();
                std::panic::resume_unwind(Box::new(message));
            }
        });
    }

    /// Cancels an in-flight run. Idempotent: cancelling a run with no active
    /// handle (already terminal, or never admitted) is a no-op that reports
    /// [`SchedulerError::NoActiveRun`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NoActiveRun`] if the run has no active
    /// handle.
    pub async fn cancel_run(&self, run_id: WorkflowRunId) -> Result<(), SchedulerError> {
        let active = self.active.lock().await;
        match active.get(&run_id) {
            Some(handle) => {
                handle.cancellation.cancel();
                Ok(())
            }
            None => Err(SchedulerError::NoActiveRun { run_id }),
        }
    }

    /// Returns the number of runs currently admitted and executing.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

/// Persists flushed run events to the run's `logs`/`output_files` fields.
///
/// Scoped to a single run: the pipeline that drives it is created fresh per
/// admitted run, so every event in a flushed batch belongs to `run_id`.
struct RunLogSink {
    repository: Arc<dyn RunRepository>,
    run_id: WorkflowRunId,
}

#[async_trait::async_trait]
impl EventSink for RunLogSink {
    async fn write_batch(&self, events: &[silver_telegram_workflow::Envelope<RunEvent>]) {
        let Ok(mut run) = self.repository.get_run(self.run_id).await else {
            warn!(run_id = %self.run_id, "dropping flushed events: run not found");
            return;
        };

        for envelope in events {
            match envelope.payload() {
                RunEvent::Log {
                    loop_index,
                    step_id,
                    action_id,
                    level,
                    message,
                    timestamp,
                    ..
                } => {
                    run.logs.push(LogEntry {
                        run_id: self.run_id,
                        loop_index: *loop_index,
                        step_id: *step_id,
                        action_id: *action_id,
                        level: *level,
                        message: message.clone(),
                        timestamp: *timestamp,
                    });
                }
                RunEvent::Error {
                    loop_index,
                    step_id,
                    action_id,
                    message,
                    timestamp,
                    ..
                } => {
                    run.logs.push(LogEntry {
                        run_id: self.run_id,
                        loop_index: *loop_index,
                        step_id: *step_id,
                        action_id: *action_id,
                        level: LogLevel::Error,
                        message: message.clone(),
                        timestamp: *timestamp,
                    });
                }
                RunEvent::OutputFile {
                    loop_index,
                    step_id,
                    action_id,
                    file_key,
                    content_type,
                    timestamp,
                    ..
                } => {
                    run.output_files.push(OutputFileRef {
                        loop_index: *loop_index,
                        step_id: *step_id,
                        action_id: *action_id,
                        uri: file_key.clone(),
                        content_type: content_type.clone(),
                        timestamp: *timestamp,
                    });
                }
            }
        }

        if let Err(e) = self.repository.update_run(&run).await {
            warn!(run_id = %self.run_id, error = %e, "failed to persist flushed run events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRunCache;
    use crate::notifier::NullNotifier;
    use crate::repository::InMemoryRunRepository;
    use crate::runner::BrowserSessionFactory;
    use async_trait::async_trait;
    use serde_json::Value;
    use silver_telegram_core::{ActionId, StepId, WorkflowId};
    use silver_telegram_workflow::{
        Action as ActionConfig, ActionTrait, BrowserSession, NullBrowserSession, Run, Step, Workflow,
        WorkflowConfig,
    };
    use std::sync::Arc;

    struct NullBrowserFactory;

    #[async_trait]
    impl BrowserSessionFactory for NullBrowserFactory {
        async fn create_session(&self) -> Result<Box<dyn BrowserSession>, RunnerError> {
            Ok(Box::new(NullBrowserSession))
        }
    }

    struct EchoAction;

    #[async_trait]
    impl ActionTrait for EchoAction {
        async fn execute(
            &self,
            config: &Value,
            _ctx: &silver_telegram_workflow::RunContext<'_>,
        ) -> Result<Value, silver_telegram_workflow::ActionError> {
            Ok(config.clone())
        }
    }

    fn setup(count: usize) -> (Arc<InMemoryRunRepository>, Vec<WorkflowRunId>, ActionRegistry) {
        let repo = Arc::new(InMemoryRunRepository::new());
        let workflow_id = WorkflowId::new();
        let project_id = ProjectId::new();
        let step = Step {
            id: StepId::new(),
            workflow_id,
            name: "step".to_string(),
            step_order: 1,
            skip_condition: None,
            run_only_condition: None,
        };
        let action = ActionConfig {
            id: ActionId::new(),
            step_id: step.id,
            action_type: "echo".to_string(),
            action_order: 1,
            config: Value::String("ok".to_string()),
        };

        repo.insert_workflow(Workflow {
            id: workflow_id,
            project_id,
            name: "wf".to_string(),
            config: WorkflowConfig::default(),
        });
        repo.insert_steps(workflow_id, vec![step.clone()]);
        repo.insert_actions(step.id, vec![action]);

        let mut run_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let run = Run::new(workflow_id, project_id, Value::Null);
            run_ids.push(run.id);
            repo.insert_run(run);
        }

        let mut registry = ActionRegistry::new();
        registry.register("echo", Arc::new(EchoAction));

        (repo, run_ids, registry)
    }

    fn test_scheduler(
        repo: Arc<InMemoryRunRepository>,
        registry: ActionRegistry,
        max_concurrent_runs: usize,
    ) -> (Scheduler, Arc<InMemoryRunCache>) {
        let cache = Arc::new(InMemoryRunCache::new());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_concurrent_runs,
                poll_interval: Duration::from_millis(10),
            },
            repo,
            cache.clone(),
            Arc::new(registry),
            Arc::new(BroadcastRegistry::new()),
            Arc::new(NullNotifier),
            Arc::new(NullBrowserFactory),
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        (scheduler, cache)
    }

    #[tokio::test]
    async fn admits_pending_run_and_completes_it() {
        let (repo, run_ids, registry) = setup(1);
        let (scheduler, cache) = test_scheduler(repo.clone(), registry, 10);
        cache.add_pending(run_ids[0]).await.unwrap();

        scheduler.admit_pending().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let run = repo.get_run(run_ids[0]).await.unwrap();
        assert_eq!(run.status, silver_telegram_workflow::RunStatus::Completed);
        assert_eq!(run.output, Some(Value::String("ok".to_string())));
    }

    #[tokio::test]
    async fn respects_max_concurrent_runs() {
        let (repo, run_ids, registry) = setup(3);
        let (scheduler, cache) = test_scheduler(repo.clone(), registry, 1);
        for run_id in &run_ids {
            cache.add_pending(*run_id).await.unwrap();
        }

        scheduler.admit_pending().await.unwrap();
        assert_eq!(scheduler.active_count().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.admit_pending().await.unwrap();

        let mut terminal_count = 0;
        for id in &run_ids {
            if repo.get_run(*id).await.unwrap().status.is_terminal() {
                terminal_count += 1;
            }
        }
        assert!(terminal_count >= 1);
    }

    #[tokio::test]
    async fn admission_skips_tick_when_at_capacity() {
        let (repo, run_ids, registry) = setup(1);
        let (scheduler, cache) = test_scheduler(repo.clone(), registry, 1);
        cache.add_pending(run_ids[0]).await.unwrap();
        cache.add_running(WorkflowRunId::new()).await.unwrap();

        scheduler.admit_pending().await.unwrap();
        assert_eq!(scheduler.active_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_run_with_no_active_handle_errors() {
        let (repo, _run_ids, registry) = setup(0);
        let (scheduler, _cache) = test_scheduler(repo, registry, 10);
        let err = scheduler.cancel_run(WorkflowRunId::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoActiveRun { .. }));
    }
}
