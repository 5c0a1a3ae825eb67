//! API response types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::job::{Job, JobData};
use crate::core::task::Task;
use crate::scheduler::SchedulerState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub scheduler: &'static str,
}

impl HealthResponse {
    pub fn new(state: SchedulerState) -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            scheduler: match state {
                SchedulerState::Running => "running",
                SchedulerState::Stopping => "stopping",
                SchedulerState::Stopped => "stopped",
            },
        }
    }
}

/// A job as the admin sees it: the submission plus live bookkeeping.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    #[serde(flatten)]
    pub data: JobData,
    pub creation_time: DateTime<Utc>,
    pub times_run: u64,
    pub next_run_at: DateTime<Utc>,
    pub is_done: bool,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            data: job.data(),
            creation_time: job.creation_time,
            times_run: job.bookkeeping.times_run,
            next_run_at: job.bookkeeping.next_run_at,
            is_done: job.bookkeeping.is_done,
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

/// Response to a job submission.
#[derive(Debug, Serialize)]
pub struct JobCreatedResponse {
    pub id: String,
}

/// What a probe needs to run a task.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub test_name: String,
    pub arguments: Value,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id.to_string(),
            test_name: task.test_name,
            arguments: task.arguments,
        }
    }
}

/// List of tasks response.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
}

/// Result of a task transition.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}
