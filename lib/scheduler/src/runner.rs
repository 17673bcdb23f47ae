//! The runner: executes a single workflow run to completion.
//!
//! Loads the workflow's steps and actions, fans out across multirun loop
//! iterations (sequential or parallel per the workflow's configuration),
//! and executes each loop's steps and actions in order, gating each step on
//! its skip/run-only condition and resolving `{{...}}` tokens in each
//! action's configuration immediately before dispatching it.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use silver_telegram_core::{ProjectId, WorkflowRunId};
use silver_telegram_workflow::{
    Action, ActionRegistry, BrowserSession, EventPipelineHandle, LogLevel, MultirunMode, RunContext,
    RunEvent, Step, StorageService, VariableContext, VariableResolver, Workflow,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;

/// Produces a fresh browser session for one loop iteration.
#[async_trait]
pub trait BrowserSessionFactory: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn BrowserSession>, RunnerError>;
}

/// A factory that always hands back [`NullBrowserSession`]. The driver that
/// actually talks to a browser is external to this crate; wire a concrete
/// [`BrowserSessionFactory`] in its place when one is available.
pub struct NullBrowserSessionFactory;

#[async_trait]
impl BrowserSessionFactory for NullBrowserSessionFactory {
    async fn create_session(&self) -> Result<Box<dyn BrowserSession>, RunnerError> {
        Ok(Box::new(silver_telegram_workflow::NullBrowserSession))
    }
}

/// A step paired with its ordered actions, as loaded from the repository.
pub type StepWithActions = (Step, Vec<Action>);

/// Executes workflow runs against a fixed action registry and event
/// pipeline.
pub struct Runner {
    registry: Arc<ActionRegistry>,
    pipeline: EventPipelineHandle,
    storage: Arc<dyn StorageService>,
}

impl Runner {
    #[must_use]
    pub fn new(
        registry: Arc<ActionRegistry>,
        pipeline: EventPipelineHandle,
        storage: Arc<dyn StorageService>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            storage,
        }
    }

    /// Runs every multirun loop iteration of `workflow` and returns the
    /// output of the last loop to complete.
    ///
    /// Sequential mode breaks on the first loop's error. Parallel mode runs
    /// every loop concurrently and returns whichever error observed first,
    /// if any (arbitrary-first-error semantics: which loop "wins" when more
    /// than one fails is unspecified).
    pub async fn run(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        project_id: ProjectId,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        cancellation: CancellationToken,
    ) -> Result<Value, RunnerError> {
        let multirun = &workflow.config.multirun;
        let count = if multirun.enabled {
            multirun.normalized_count()
        } else {
            1
        };

        if !multirun.enabled || matches!(multirun.mode, MultirunMode::Sequential) {
            self.run_sequential(
                workflow,
                steps,
                run_id,
                project_id,
                browser_factory,
                cancellation,
                count,
                multirun.delay_ms,
            )
            .await
        } else {
            self.run_parallel(workflow, steps, run_id, project_id, browser_factory, cancellation, count)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        project_id: ProjectId,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        cancellation: CancellationToken,
        count: u32,
        delay_ms: u64,
    ) -> Result<Value, RunnerError> {
        let mut last_output = Value::Null;
        for loop_index in 0..count {
            if cancellation.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            if loop_index > 0 && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            last_output = self
                .execute_guarded(
                    workflow,
                    steps,
                    run_id,
                    project_id,
                    loop_index,
                    browser_factory.clone(),
                    cancellation.clone(),
                )
                .await?;
        }
        Ok(last_output)
    }

    async fn run_parallel(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        project_id: ProjectId,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        cancellation: CancellationToken,
        count: u32,
    ) -> Result<Value, RunnerError> {
        let results = futures::future::join_all((0..count).map(|loop_index| {
            self.execute_guarded(
                workflow,
                steps,
                run_id,
                project_id,
                loop_index,
                browser_factory.clone(),
                cancellation.clone(),
            )
        }))
        .await;

        let mut last_output = Value::Null;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(output) => last_output = output,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(last_output),
        }
    }

    /// Runs one loop iteration inside a panic guard, converting any panic
    /// into a [`RunnerError::Panic`] rather than letting it escape.
    #[allow(clippy::too_many_arguments)]
    async fn execute_guarded(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        project_id: ProjectId,
        loop_index: u32,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        cancellation: CancellationToken,
    ) -> Result<Value, RunnerError> {
        let future = self.execute_single_run(
            workflow,
            steps,
            run_id,
            project_id,
            loop_index,
            browser_factory,
            cancellation,
        );

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&payload);
                Err(RunnerError::Panic { message })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_single_run(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        project_id: ProjectId,
        loop_index: u32,
        browser_factory: Arc<dyn BrowserSessionFactory>,
        cancellation: CancellationToken,
    ) -> Result<Value, RunnerError> {
        let browser = browser_factory.create_session().await?;

        let mut variable_context = VariableContext::from_config(&workflow.config);
        variable_context.set_runtime("loop_index", Value::from(loop_index));
        variable_context.set_reserved("loopIndex", Value::from(loop_index));
        variable_context.set_reserved("localLoopIndex", Value::from(loop_index));
        variable_context.set_reserved("timestamp", Value::String(chrono::Utc::now().to_rfc3339()));
        variable_context.set_reserved("runId", Value::String(run_id.to_string()));
        variable_context.set_reserved("userId", Value::String(String::new()));
        variable_context.set_reserved("projectId", Value::String(project_id.to_string()));
        variable_context.set_reserved("automationId", Value::String(workflow.id.to_string()));
        let resolver = VariableResolver::new(&variable_context);
        let key = (project_id, workflow.id, run_id);

        let result = self
            .run_steps(
                workflow,
                steps,
                run_id,
                loop_index,
                browser.as_ref(),
                &variable_context,
                &resolver,
                &cancellation,
                key,
            )
            .await;

        // Release the browser session on every exit path, success or error.
        let _ = browser.close().await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        workflow: &Workflow,
        steps: &[StepWithActions],
        run_id: WorkflowRunId,
        loop_index: u32,
        browser: &dyn BrowserSession,
        variable_context: &VariableContext,
        resolver: &VariableResolver<'_>,
        cancellation: &CancellationToken,
        key: silver_telegram_workflow::SubscriptionKey,
    ) -> Result<Value, RunnerError> {
        let mut last_output = Value::Null;

        for (step, actions) in steps {
            if cancellation.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            if let Some(skip) = step.skip_condition {
                if skip.evaluate(loop_index) {
                    continue;
                }
            }
            if let Some(run_only) = step.run_only_condition {
                if !run_only.evaluate(loop_index) {
                    continue;
                }
            }

            let _ = self
                .pipeline
                .emit(
                    key,
                    RunEvent::Log {
                        run_id,
                        loop_index,
                        step_id: Some(step.id),
                        action_id: None,
                        level: LogLevel::Info,
                        message: format!("starting step '{}'", step.name),
                        timestamp: chrono::Utc::now(),
                    },
                )
                .await;

            for action in actions {
                if cancellation.is_cancelled() {
                    return Err(RunnerError::Cancelled);
                }

                let resolved_config =
                    resolver
                        .resolve_value(&action.config)
                        .map_err(|e| RunnerError::Config {
                            message: e.to_string(),
                        })?;

                let implementation =
                    self.registry
                        .resolve(action)
                        .map_err(|_| RunnerError::UnknownAction {
                            action_type: action.action_type.clone(),
                        })?;

                let ctx = RunContext {
                    browser_session: browser,
                    storage_service: self.storage.as_ref(),
                    logger: tracing::info_span!(
                        "action",
                        action_id = %action.id,
                        action_type = %action.action_type,
                        loop_index,
                        step_id = %step.id,
                    ),
                    event_sink: self.pipeline.clone(),
                    registry: self.registry.clone(),
                    run_id,
                    loop_index,
                    step_id: step.id,
                    step_name: &step.name,
                    action_id: action.id,
                    action_type: &action.action_type,
                    variable_context,
                    workflow,
                };

                match implementation.execute(&resolved_config, &ctx).await {
                    Ok(output) => last_output = output,
                    Err(e) => {
                        let _ = self
                            .pipeline
                            .emit(
                                key,
                                RunEvent::Error {
                                    run_id,
                                    loop_index,
                                    step_id: Some(step.id),
                                    action_id: Some(action.id),
                                    message: e.to_string(),
                                    timestamp: chrono::Utc::now(),
                                },
                            )
                            .await;
                        return Err(RunnerError::ActionFailure {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(last_output)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silver_telegram_core::{ActionId, StepId, WorkflowId};
    use silver_telegram_workflow::{
        ActionError, ActionTrait, BrowserSession as _, BroadcastRegistry, EventPipeline,
        NullBrowserSession, WorkflowConfig,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEchoAction {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ActionTrait for CountingEchoAction {
        async fn execute(
            &self,
            config: &Value,
            _ctx: &RunContext<'_>,
        ) -> Result<Value, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(config.clone())
        }
    }

    struct FailingAction;

    #[async_trait]
    impl ActionTrait for FailingAction {
        async fn execute(&self, _config: &Value, _ctx: &RunContext<'_>) -> Result<Value, ActionError> {
            Err(ActionError::ExecutionFailed {
                message: "boom".to_string(),
            })
        }
    }

    struct NullBrowserFactory;

    #[async_trait]
    impl BrowserSessionFactory for NullBrowserFactory {
        async fn create_session(&self) -> Result<Box<dyn BrowserSession>, RunnerError> {
            Ok(Box::new(NullBrowserSession))
        }
    }

    fn test_workflow(multirun_enabled: bool, mode: MultirunMode, count: u32) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            project_id: ProjectId::new(),
            name: "test".to_string(),
            config: WorkflowConfig {
                multirun: silver_telegram_workflow::MultirunConfig {
                    enabled: multirun_enabled,
                    mode,
                    count,
                    delay_ms: 0,
                },
                ..Default::default()
            },
        }
    }

    fn single_echo_step(calls: Arc<AtomicUsize>) -> (ActionRegistry, Vec<StepWithActions>) {
        let mut registry = ActionRegistry::new();
        registry.register("echo", Arc::new(CountingEchoAction { calls }));

        let step = Step {
            id: StepId::new(),
            workflow_id: WorkflowId::new(),
            name: "step".to_string(),
            step_order: 1,
            skip_condition: None,
            run_only_condition: None,
        };
        let action = Action {
            id: ActionId::new(),
            step_id: step.id,
            action_type: "echo".to_string(),
            action_order: 1,
            config: Value::String("payload".to_string()),
        };

        (registry, vec![(step, vec![action])])
    }

    #[tokio::test]
    async fn single_loop_runs_every_action_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (registry, steps) = single_echo_step(calls.clone());
        let (pipeline, handle) = EventPipeline::new();
        let registry_broadcast = Arc::new(BroadcastRegistry::new());
        let registry_for_task = registry_broadcast.clone();
        tokio::spawn(async move {
            pipeline.run(silver_telegram_workflow::NullEventSink, &registry_for_task).await;
        });

        let runner = Runner::new(
            Arc::new(registry),
            handle,
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        let workflow = test_workflow(false, MultirunMode::Sequential, 1);

        let output = runner
            .run(
                &workflow,
                &steps,
                WorkflowRunId::new(),
                ProjectId::new(),
                Arc::new(NullBrowserFactory),
                CancellationToken::new(),
            )
            .await
            .expect("run should succeed");

        assert_eq!(output, Value::String("payload".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_multirun_executes_every_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (registry, steps) = single_echo_step(calls.clone());
        let (pipeline, handle) = EventPipeline::new();
        let registry_broadcast = Arc::new(BroadcastRegistry::new());
        let registry_for_task = registry_broadcast.clone();
        tokio::spawn(async move {
            pipeline.run(silver_telegram_workflow::NullEventSink, &registry_for_task).await;
        });

        let runner = Runner::new(
            Arc::new(registry),
            handle,
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        let workflow = test_workflow(true, MultirunMode::Sequential, 3);

        runner
            .run(
                &workflow,
                &steps,
                WorkflowRunId::new(),
                ProjectId::new(),
                Arc::new(NullBrowserFactory),
                CancellationToken::new(),
            )
            .await
            .expect("run should succeed");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sequential_multirun_stops_on_first_error() {
        let mut registry = ActionRegistry::new();
        registry.register("fail", Arc::new(FailingAction));
        let step = Step {
            id: StepId::new(),
            workflow_id: WorkflowId::new(),
            name: "step".to_string(),
            step_order: 1,
            skip_condition: None,
            run_only_condition: None,
        };
        let action = Action {
            id: ActionId::new(),
            step_id: step.id,
            action_type: "fail".to_string(),
            action_order: 1,
            config: Value::Null,
        };
        let steps = vec![(step, vec![action])];

        let (pipeline, handle) = EventPipeline::new();
        let registry_broadcast = Arc::new(BroadcastRegistry::new());
        let registry_for_task = registry_broadcast.clone();
        tokio::spawn(async move {
            pipeline.run(silver_telegram_workflow::NullEventSink, &registry_for_task).await;
        });

        let runner = Runner::new(
            Arc::new(registry),
            handle,
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        let workflow = test_workflow(true, MultirunMode::Sequential, 5);

        let err = runner
            .run(
                &workflow,
                &steps,
                WorkflowRunId::new(),
                ProjectId::new(),
                Arc::new(NullBrowserFactory),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::ActionFailure { .. }));
    }

    #[tokio::test]
    async fn unknown_action_type_errors() {
        let registry = ActionRegistry::new();
        let step = Step {
            id: StepId::new(),
            workflow_id: WorkflowId::new(),
            name: "step".to_string(),
            step_order: 1,
            skip_condition: None,
            run_only_condition: None,
        };
        let action = Action {
            id: ActionId::new(),
            step_id: step.id,
            action_type: "does_not_exist".to_string(),
            action_order: 1,
            config: Value::Null,
        };
        let steps = vec![(step, vec![action])];

        let (pipeline, handle) = EventPipeline::new();
        let registry_broadcast = Arc::new(BroadcastRegistry::new());
        let registry_for_task = registry_broadcast.clone();
        tokio::spawn(async move {
            pipeline.run(silver_telegram_workflow::NullEventSink, &registry_for_task).await;
        });

        let runner = Runner::new(
            Arc::new(registry),
            handle,
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        let workflow = test_workflow(false, MultirunMode::Sequential, 1);

        let err = runner
            .run(
                &workflow,
                &steps,
                WorkflowRunId::new(),
                ProjectId::new(),
                Arc::new(NullBrowserFactory),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn cancellation_before_start_stops_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (registry, steps) = single_echo_step(calls.clone());
        let (pipeline, handle) = EventPipeline::new();
        let registry_broadcast = Arc::new(BroadcastRegistry::new());
        let registry_for_task = registry_broadcast.clone();
        tokio::spawn(async move {
            pipeline.run(silver_telegram_workflow::NullEventSink, &registry_for_task).await;
        });

        let runner = Runner::new(
            Arc::new(registry),
            handle,
            Arc::new(silver_telegram_workflow::NullStorageService),
        );
        let workflow = test_workflow(false, MultirunMode::Sequential, 1);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let err = runner
            .run(
                &workflow,
                &steps,
                WorkflowRunId::new(),
                ProjectId::new(),
                Arc::new(NullBrowserFactory),
                cancellation,
            )
            .await
            .unwrap_err();

        assert_eq!(err, RunnerError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
