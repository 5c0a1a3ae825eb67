//! API error types and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::lifecycle::LifecycleError;
use crate::scheduler::SchedulerError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request input (schedule, `since`, ...).
    BadRequest(String),
    /// No caller identity on a probe route.
    Unauthorized(String),
    /// The task belongs to another probe.
    AccessDenied(String),
    /// Task not found.
    TaskNotFound(String),
    /// Any other resource not found.
    NotFound(String),
    /// The task is not in a state the transition starts from.
    InconsistentState(String),
    /// Storage failed; the client should retry later.
    StorageUnavailable(String),
    /// The scheduler is not accepting commands.
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::AccessDenied(_) => (StatusCode::FORBIDDEN, "ACCESS_DENIED"),
            ApiError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InconsistentState(_) => (StatusCode::CONFLICT, "INCONSISTENT_STATE"),
            ApiError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::AccessDenied(msg)
            | ApiError::TaskNotFound(msg)
            | ApiError::NotFound(msg)
            | ApiError::InconsistentState(msg)
            | ApiError::StorageUnavailable(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg) => msg,
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::TaskNotFound(_) => ApiError::TaskNotFound(err.to_string()),
            LifecycleError::AccessDenied(_) => ApiError::AccessDenied(err.to_string()),
            LifecycleError::InconsistentState { .. } => {
                ApiError::InconsistentState(err.to_string())
            }
            LifecycleError::Storage(e) => e.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::MalformedSchedule(e) => ApiError::BadRequest(e.to_string()),
            SchedulerError::JobNotFound(msg) => ApiError::NotFound(format!("job not found: {}", msg)),
            SchedulerError::NotRunning => {
                ApiError::ServiceUnavailable("scheduler is not running".to_string())
            }
            SchedulerError::Storage(e) => e.into(),
            SchedulerError::ChannelError(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        tracing::error!(error = %err, "storage failure while serving request");
        ApiError::StorageUnavailable(err.to_string())
    }
}
