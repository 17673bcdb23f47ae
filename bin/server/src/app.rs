//! HTTP routes for submitting, inspecting, and cancelling workflow runs.

use crate::error::ApiError;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use silver_telegram_core::{WorkflowId, WorkflowRunId};
use silver_telegram_scheduler::{CachedStatus, RunCache, RunRepository, Scheduler};
use silver_telegram_workflow::{BroadcastRegistry, Run, RunStatus};
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub repository: Arc<dyn RunRepository>,
    pub cache: Arc<dyn RunCache>,
    pub broadcast: Arc<BroadcastRegistry>,
    pub max_concurrent_runs: usize,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(submit_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(stream_events))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitRunRequest {
    workflow_id: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Serialize)]
struct RunResponse {
    id: String,
    status: String,
}

impl From<&Run> for RunResponse {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.to_string(),
            status: format!("{:?}", run.status).to_lowercase(),
        }
    }
}

async fn submit_run(
    State(state): State<AppState>,
    Json(req): Json<SubmitRunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let workflow_id =
        WorkflowId::from_str(&req.workflow_id).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let workflow = state.repository.get_workflow(workflow_id).await?;

    let mut run = Run::new(workflow_id, workflow.project_id, req.input);
    let running_count = state.cache.running_count().await?;
    if running_count >= state.max_concurrent_runs {
        run.status = RunStatus::Queued;
    }

    state.repository.create_run(&run).await?;
    state.cache.add_pending(run.id).await?;
    state
        .cache
        .set_status(
            run.id,
            CachedStatus {
                status: format!("{:?}", run.status).to_lowercase(),
                error_message: None,
            },
        )
        .await?;

    Ok(Json(RunResponse::from(&run)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run_id = WorkflowRunId::from_str(&id).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let run = state.repository.get_run(run_id).await?;
    Ok(Json(run))
}

#[derive(Deserialize)]
struct ListRunsQuery {
    workflow_id: Option<String>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let Some(workflow_id) = query.workflow_id else {
        return Err(ApiError::InvalidRequest(
            "workflow_id query parameter is required".to_string(),
        ));
    };
    let workflow_id =
        WorkflowId::from_str(&workflow_id).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let runs = state.repository.list_runs_for_workflow(workflow_id).await?;
    Ok(Json(runs.iter().map(RunResponse::from).collect()))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = WorkflowRunId::from_str(&id).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    state.scheduler.cancel_run(run_id).await?;
    Ok(axum::http::StatusCode::ACCEPTED)
}

async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run_id = WorkflowRunId::from_str(&id).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let run = state.repository.get_run(run_id).await?;
    let key = (run.project_id, run.workflow_id, run_id);

    let receiver = state.broadcast.subscribe(key);
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().data(payload)), receiver));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
