//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::job::{Job, JobData};
use crate::core::schedule::ScheduleError;
use crate::core::types::JobId;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The submitted schedule could not be parsed. Nothing was persisted.
    #[error(transparent)]
    MalformedSchedule(#[from] ScheduleError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The scheduler has been shut down.
    #[error("scheduler is not running")]
    NotRunning,
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is running.
    Running,
    /// Shutdown was requested; runners are being drained.
    Stopping,
    /// Scheduler is stopped.
    Stopped,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Persist a new job and start its runner.
    AddJob {
        data: JobData,
        response: oneshot::Sender<Result<JobId, SchedulerError>>,
    },
    /// List every job with live bookkeeping.
    ListJobs {
        response: oneshot::Sender<Result<Vec<Job>, SchedulerError>>,
    },
    /// Look up one job with live bookkeeping.
    JobStatus {
        job_id: JobId,
        response: oneshot::Sender<Result<Job, SchedulerError>>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
