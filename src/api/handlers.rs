//! API request handlers.

use axum::{
    Json,
    extract::{FromRequestParts, Path, Query, State},
    http::request::Parts,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::job::JobData;
use crate::core::task::Transition;
use crate::core::types::{JobId, ProbeId, TaskId};
use crate::lifecycle::TaskLifecycle;
use crate::scheduler::SchedulerHandle;
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    HealthResponse, JobCreatedResponse, JobListResponse, JobResponse, StatusResponse,
    TaskListResponse, TaskResponse,
};

/// Header carrying the verified probe id, set by the identity layer in front
/// of this service.
pub const PROBE_ID_HEADER: &str = "x-probe-id";

/// Lower bound for task listings when the probe sends no `since`.
pub const DEFAULT_SINCE: &str = "2016-10-20T10:30:00Z";

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub handle: SchedulerHandle,
    pub lifecycle: TaskLifecycle<S>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

/// The probe making the request.
#[derive(Debug, Clone)]
pub struct CallerProbe(pub ProbeId);

impl<S: Send + Sync> FromRequestParts<S> for CallerProbe {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(PROBE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing probe identity".to_string()))?;
        Ok(CallerProbe(ProbeId::new(value)))
    }
}

/// Query parameters for the task listing.
#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub since: Option<String>,
}

fn parse_since(since: Option<&str>) -> Result<DateTime<Utc>, ApiError> {
    let raw = since.unwrap_or(DEFAULT_SINCE);
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::BadRequest("invalid since specified".to_string()))
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    // an id that cannot exist is reported like any other missing task
    TaskId::parse(raw).map_err(|_| ApiError::TaskNotFound(format!("task not found: {}", raw)))
}

/// Health check endpoint.
pub async fn health<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.handle.state().await))
}

/// List all jobs.
pub async fn list_jobs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = state.handle.list_jobs().await?;
    let jobs = jobs.iter().map(JobResponse::from).collect();
    Ok(Json(JobListResponse { jobs }))
}

/// Register a new job.
pub async fn add_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(data): Json<JobData>,
) -> Result<Json<JobCreatedResponse>, ApiError> {
    let job_id = state.handle.add_job(data).await?;
    Ok(Json(JobCreatedResponse {
        id: job_id.to_string(),
    }))
}

/// Get a specific job.
pub async fn get_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = JobId::parse(&job_id)
        .map_err(|_| ApiError::NotFound(format!("job not found: {}", job_id)))?;
    let job = state.handle.job_status(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// Ready tasks for the calling probe.
pub async fn list_tasks<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    CallerProbe(probe): CallerProbe,
    Query(query): Query<TasksQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let since = parse_since(query.since.as_deref())?;
    let tasks = state.lifecycle.get_tasks_for_user(&probe, since).await?;
    let tasks = tasks.into_iter().map(TaskResponse::from).collect();
    Ok(Json(TaskListResponse { tasks }))
}

/// Get a task owned by the calling probe.
pub async fn get_task<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    CallerProbe(probe): CallerProbe,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.lifecycle.get_task(&task_id, &probe).await?;
    Ok(Json(TaskResponse::from(task)))
}

async fn apply_transition<S: Storage + 'static>(
    state: &ApiState<S>,
    probe: &ProbeId,
    raw_id: &str,
    transition: Transition,
) -> Result<Json<StatusResponse>, ApiError> {
    let task_id = parse_task_id(raw_id)?;
    state.lifecycle.advance(&task_id, probe, transition).await?;
    Ok(Json(StatusResponse {
        status: transition.target().as_str(),
    }))
}

/// Accept a task.
pub async fn accept_task<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    CallerProbe(probe): CallerProbe,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    apply_transition(&state, &probe, &task_id, Transition::Accept).await
}

/// Reject a task.
pub async fn reject_task<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    CallerProbe(probe): CallerProbe,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    apply_transition(&state, &probe, &task_id, Transition::Reject).await
}

/// Mark a task done.
pub async fn done_task<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    CallerProbe(probe): CallerProbe,
    Path(task_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    apply_transition(&state, &probe, &task_id, Transition::Done).await
}
