//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the scheduler through commands like add, list, status, and shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::job::{Job, JobData};
use crate::core::types::JobId;

use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        if self.state().await != SchedulerState::Running {
            return Err(SchedulerError::NotRunning);
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Register a job: parse its schedule, persist it, start its runner.
    ///
    /// A malformed schedule is rejected before anything is written.
    pub async fn add_job(&self, data: JobData) -> Result<JobId, SchedulerError> {
        self.send_result_command(|response| SchedulerCommand::AddJob { data, response }, "add_job")
            .await
    }

    /// Every job, oldest first, with its current bookkeeping.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        self.send_result_command(|response| SchedulerCommand::ListJobs { response }, "list_jobs")
            .await
    }

    /// One job with its current bookkeeping.
    pub async fn job_status(&self, job_id: JobId) -> Result<Job, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::JobStatus { job_id, response },
            "job_status",
        )
        .await
    }

    /// Shutdown the scheduler.
    ///
    /// Signals every runner, waits for them up to the configured timeout and
    /// returns once the command loop has stopped. Calling it again after the
    /// scheduler stopped is a no-op.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.state().await == SchedulerState::Stopped {
            return Ok(());
        }

        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(SchedulerCommand::Shutdown {
                response: response_tx,
            })
            .await
            .map_err(|_| ());

        // A concurrent shutdown may close the loop under us.
        match (sent, response_rx.await) {
            (Ok(()), Ok(())) => Ok(()),
            _ if self.state().await == SchedulerState::Stopped => Ok(()),
            _ => Err(SchedulerError::ChannelError(
                "failed to complete shutdown".into(),
            )),
        }
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
