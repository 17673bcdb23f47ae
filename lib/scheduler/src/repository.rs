//! Persistence for runs, workflows, steps, and actions.

use async_trait::async_trait;
use silver_telegram_workflow::{Action, LogEntry, OutputFileRef, Run, RunStatus, Step, Workflow};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::RepositoryError;
use silver_telegram_core::{ActionId, ProjectId, StepId, WorkflowId, WorkflowRunId};

/// Read/write access to runs, and read-only access to the workflow
/// definitions (steps, actions) a run executes against.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError>;
    async fn get_run(&self, id: WorkflowRunId) -> Result<Run, RepositoryError>;
    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError>;
    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError>;
    async fn get_steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>, RepositoryError>;
    async fn get_actions(&self, step_id: StepId) -> Result<Vec<Action>, RepositoryError>;

    /// Returns ids of runs eligible for admission (pending or queued),
    /// oldest first.
    async fn list_pending_runs(&self) -> Result<Vec<WorkflowRunId>, RepositoryError>;

    /// Returns every run for a workflow, most recent first.
    async fn list_runs_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Run>, RepositoryError>;
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    workflow_id: String,
    project_id: String,
    status: String,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    logs_text: String,
    output_files_text: String,
    error_message: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn decode_id_error(id_type: &str, value: &str, reason: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {id_type} '{value}': {reason}"),
    )))
}

impl RunRow {
    fn try_into_run(self) -> Result<Run, sqlx::Error> {
        let id = WorkflowRunId::from_str(&self.id).map_err(|e| decode_id_error("run id", &self.id, e))?;
        let workflow_id = WorkflowId::from_str(&self.workflow_id)
            .map_err(|e| decode_id_error("workflow id", &self.workflow_id, e))?;
        let project_id = ProjectId::from_str(&self.project_id)
            .map_err(|e| decode_id_error("project id", &self.project_id, e))?;
        let status = serde_json::from_value(serde_json::Value::String(self.status.clone()))
            .map_err(|e| decode_id_error("run status", &self.status, e))?;
        let logs: Vec<LogEntry> = serde_json::from_str(&self.logs_text)
            .map_err(|e| decode_id_error("run logs", &self.logs_text, e))?;
        let output_files: Vec<OutputFileRef> = serde_json::from_str(&self.output_files_text)
            .map_err(|e| decode_id_error("run output files", &self.output_files_text, e))?;

        Ok(Run {
            id,
            workflow_id,
            project_id,
            status,
            input: self.input,
            output: self.output,
            logs,
            output_files,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    project_id: String,
    name: String,
    config: serde_json::Value,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> Result<Workflow, sqlx::Error> {
        let id = WorkflowId::from_str(&self.id).map_err(|e| decode_id_error("workflow id", &self.id, e))?;
        let project_id = ProjectId::from_str(&self.project_id)
            .map_err(|e| decode_id_error("project id", &self.project_id, e))?;
        let config = serde_json::from_value(self.config)
            .map_err(|e| decode_id_error("workflow config", &self.name, e))?;

        Ok(Workflow {
            id,
            project_id,
            name: self.name,
            config,
        })
    }
}

#[derive(FromRow)]
struct StepRow {
    id: String,
    workflow_id: String,
    name: String,
    step_order: i32,
    skip_condition: Option<serde_json::Value>,
    run_only_condition: Option<serde_json::Value>,
}

impl StepRow {
    fn try_into_step(self) -> Result<Step, sqlx::Error> {
        let id = StepId::from_str(&self.id).map_err(|e| decode_id_error("step id", &self.id, e))?;
        let workflow_id = WorkflowId::from_str(&self.workflow_id)
            .map_err(|e| decode_id_error("workflow id", &self.workflow_id, e))?;
        let skip_condition = self
            .skip_condition
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_id_error("skip condition", &self.name, e))?;
        let run_only_condition = self
            .run_only_condition
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_id_error("run_only condition", &self.name, e))?;

        Ok(Step {
            id,
            workflow_id,
            name: self.name,
            step_order: self.step_order,
            skip_condition,
            run_only_condition,
        })
    }
}

#[derive(FromRow)]
struct ActionRow {
    id: String,
    step_id: String,
    action_type: String,
    action_order: i32,
    config: serde_json::Value,
}

impl ActionRow {
    fn try_into_action(self) -> Result<Action, sqlx::Error> {
        let id = ActionId::from_str(&self.id).map_err(|e| decode_id_error("action id", &self.id, e))?;
        let step_id = StepId::from_str(&self.step_id)
            .map_err(|e| decode_id_error("step id", &self.step_id, e))?;

        Ok(Action {
            id,
            step_id,
            action_type: self.action_type,
            action_order: self.action_order,
            config: self.config,
        })
    }
}

fn map_sqlx_err(id: WorkflowRunId) -> impl Fn(sqlx::Error) -> RepositoryError {
    move |e| match e {
        sqlx::Error::RowNotFound => RepositoryError::RunNotFound { id },
        other => RepositoryError::Database {
            message: other.to_string(),
        },
    }
}

/// A `sqlx::PgPool`-backed [`RunRepository`].
pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let status = serde_json::to_value(run.status)
            .map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let logs_text = serde_json::to_string(&run.logs).map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;
        let output_files_text =
            serde_json::to_string(&run.output_files).map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })?;

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, project_id, status, input, output, logs_text,
                 output_files_text, error_message, created_at, updated_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.project_id.to_string())
        .bind(status)
        .bind(&run.input)
        .bind(&run.output)
        .bind(logs_text)
        .bind(output_files_text)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        Ok(())
    }

    async fn get_run(&self, id: WorkflowRunId) -> Result<Run, RepositoryError> {
        let row: RunRow = sqlx::query_as(
            r#"
            SELECT id, workflow_id, project_id, status, input, output, logs_text,
                   output_files_text, error_message, created_at, updated_at, started_at, finished_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err(id))?;

        row.try_into_run().map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let status = serde_json::to_value(run.status)
            .map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let logs_text = serde_json::to_string(&run.logs).map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;
        let output_files_text =
            serde_json::to_string(&run.output_files).map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, output = $3, logs_text = $4, output_files_text = $5,
                error_message = $6, updated_at = $7, started_at = $8, finished_at = $9
            WHERE id = $1
            "#,
        )
        .bind(run.id.to_string())
        .bind(status)
        .bind(&run.output)
        .bind(logs_text)
        .bind(output_files_text)
        .bind(&run.error_message)
        .bind(run.updated_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError> {
        let row: WorkflowRow = sqlx::query_as(
            r#"
            SELECT id, project_id, name, config
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::WorkflowNotFound { id },
            other => RepositoryError::Database {
                message: other.to_string(),
            },
        })?;

        row.try_into_workflow().map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })
    }

    async fn get_steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>, RepositoryError> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, name, step_order, skip_condition, run_only_condition
            FROM workflow_steps
            WHERE workflow_id = $1
            ORDER BY step_order ASC
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        rows.into_iter()
            .map(|r| r.try_into_step())
            .collect::<Result<_, _>>()
            .map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })
    }

    async fn get_actions(&self, step_id: StepId) -> Result<Vec<Action>, RepositoryError> {
        let rows: Vec<ActionRow> = sqlx::query_as(
            r#"
            SELECT id, step_id, action_type, action_order, config
            FROM workflow_step_actions
            WHERE step_id = $1
            ORDER BY action_order ASC
            "#,
        )
        .bind(step_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        rows.into_iter()
            .map(|r| r.try_into_action())
            .collect::<Result<_, _>>()
            .map_err(|e| RepositoryError::Database {
                message: e.to_string(),
            })
    }

    async fn list_pending_runs(&self) -> Result<Vec<WorkflowRunId>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM workflow_runs
            WHERE status IN ('pending', 'queued')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        rows.into_iter()
            .map(|(id,)| {
                WorkflowRunId::from_str(&id).map_err(|e| RepositoryError::Database {
                    message: decode_id_error("run id", &id, e).to_string(),
                })
            })
            .collect()
    }

    async fn list_runs_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Run>, RepositoryError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, project_id, status, input, output, logs_text,
                   output_files_text, error_message, created_at, updated_at, started_at, finished_at
            FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database {
            message: e.to_string(),
        })?;

        rows.into_iter()
            .map(|r| {
                r.try_into_run().map_err(|e| RepositoryError::Database {
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

/// An in-memory [`RunRepository`] for tests.
#[derive(Default)]
pub struct InMemoryRunRepository {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    runs: HashMap<WorkflowRunId, Run>,
    workflows: HashMap<WorkflowId, Workflow>,
    steps: HashMap<WorkflowId, Vec<Step>>,
    actions: HashMap<StepId, Vec<Action>>,
}

impl InMemoryRunRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&self, run: Run) {
        self.inner.lock().expect("lock poisoned").runs.insert(run.id, run);
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .workflows
            .insert(workflow.id, workflow);
    }

    pub fn insert_steps(&self, workflow_id: WorkflowId, steps: Vec<Step>) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .steps
            .insert(workflow_id, steps);
    }

    pub fn insert_actions(&self, step_id: StepId, actions: Vec<Action>) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .actions
            .insert(step_id, actions);
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.insert_run(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: WorkflowRunId) -> Result<Run, RepositoryError> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .runs
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::RunNotFound { id })
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .runs
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, RepositoryError> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .workflows
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::WorkflowNotFound { id })
    }

    async fn get_steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .expect("lock poisoned")
            .steps
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_actions(&self, step_id: StepId) -> Result<Vec<Action>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .expect("lock poisoned")
            .actions
            .get(&step_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pending_runs(&self) -> Result<Vec<WorkflowRunId>, RepositoryError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut runs: Vec<&Run> = inner
            .runs
            .values()
            .filter(|run| matches!(run.status, RunStatus::Pending | RunStatus::Queued))
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs.into_iter().map(|run| run.id).collect())
    }

    async fn list_runs_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Run>, RepositoryError> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use silver_telegram_workflow::WorkflowConfig;

    #[tokio::test]
    async fn in_memory_repository_round_trips_run() {
        let repo = InMemoryRunRepository::new();
        let run = Run::new(WorkflowId::new(), ProjectId::new(), Value::Null);
        repo.insert_run(run.clone());

        let fetched = repo.get_run(run.id).await.unwrap();
        assert_eq!(fetched.id, run.id);
    }

    #[tokio::test]
    async fn in_memory_repository_missing_run_errors() {
        let repo = InMemoryRunRepository::new();
        let err = repo.get_run(WorkflowRunId::new()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn in_memory_repository_returns_steps_in_order() {
        let repo = InMemoryRunRepository::new();
        let workflow_id = WorkflowId::new();
        repo.insert_workflow(Workflow {
            id: workflow_id,
            project_id: ProjectId::new(),
            name: "wf".to_string(),
            config: WorkflowConfig::default(),
        });
        let step = Step {
            id: StepId::new(),
            workflow_id,
            name: "step one".to_string(),
            step_order: 1,
            skip_condition: None,
            run_only_condition: None,
        };
        repo.insert_steps(workflow_id, vec![step.clone()]);

        let steps = repo.get_steps(workflow_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, step.id);
    }

    #[tokio::test]
    async fn list_pending_runs_excludes_terminal_runs() {
        let repo = InMemoryRunRepository::new();
        let pending = Run::new(WorkflowId::new(), ProjectId::new(), Value::Null);
        let mut completed = Run::new(WorkflowId::new(), ProjectId::new(), Value::Null);
        completed.complete(Value::Null);

        repo.insert_run(pending.clone());
        repo.insert_run(completed);

        let ids = repo.list_pending_runs().await.unwrap();
        assert_eq!(ids, vec![pending.id]);
    }

    #[tokio::test]
    async fn list_runs_for_workflow_filters_and_orders_by_recency() {
        let repo = InMemoryRunRepository::new();
        let workflow_id = WorkflowId::new();
        let other_workflow_id = WorkflowId::new();

        let first = Run::new(workflow_id, ProjectId::new(), Value::Null);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Run::new(workflow_id, ProjectId::new(), Value::Null);
        let unrelated = Run::new(other_workflow_id, ProjectId::new(), Value::Null);

        repo.insert_run(first.clone());
        repo.insert_run(second.clone());
        repo.insert_run(unrelated);

        let runs = repo.list_runs_for_workflow(workflow_id).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
    }
}
