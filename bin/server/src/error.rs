//! API error types and their HTTP representation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use silver_telegram_scheduler::{CacheError, RepositoryError, SchedulerError};
use std::fmt;

/// Errors surfaced to API clients.
#[derive(Debug)]
pub enum ApiError {
    /// The referenced run or workflow does not exist.
    NotFound(String),
    /// The request body failed validation.
    InvalidRequest(String),
    /// A dependency (database, cache) failed.
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(message) => write!(f, "not found: {message}"),
            Self::InvalidRequest(message) => write!(f, "invalid request: {message}"),
            Self::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::RunNotFound { id } => Self::NotFound(format!("run {id}")),
            RepositoryError::WorkflowNotFound { id } => Self::NotFound(format!("workflow {id}")),
            RepositoryError::Database { message } => Self::Internal(message),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::NoActiveRun { run_id } => {
                Self::InvalidRequest(format!("run {run_id} is not active"))
            }
            SchedulerError::Admission { run_id } => {
                Self::Internal(format!("admission failed for run {run_id}"))
            }
        }
    }
}
