//! Probe-facing task operations.
//!
//! [`TaskLifecycle`] reads tasks on behalf of a probe and moves them along
//! the transition table. Every state change is a conditional update in
//! storage; there is no in-process lock, so concurrent requests for the
//! same task resolve to exactly one winner.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::core::clock::Clock;
use crate::core::task::{Task, TaskState, TimestampField, Transition};
use crate::core::types::{ProbeId, TaskId};
use crate::events::{Event, EventBus};
use crate::storage::{StorageError, TaskStore};

/// Errors returned by task operations.
///
/// Everything but `Storage` is an expected outcome of a probe request.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No task has this id.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task belongs to another probe.
    #[error("access denied to task {0}")]
    AccessDenied(TaskId),

    /// The task is not in a state the requested transition starts from.
    #[error("task {task_id} cannot move to {target} from its current state")]
    InconsistentState { task_id: TaskId, target: TaskState },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Guarded task reads and transitions.
pub struct TaskLifecycle<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
}

impl<S> Clone for TaskLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
            event_bus: Arc::clone(&self.event_bus),
        }
    }
}

impl<S: TaskStore> TaskLifecycle<S> {
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>, event_bus: Arc<EventBus>) -> Self {
        Self {
            storage,
            clock,
            event_bus,
        }
    }

    /// Fetch a task on behalf of `caller`.
    ///
    /// A missing task is reported before an ownership mismatch.
    pub async fn get_task(&self, task_id: &TaskId, caller: &ProbeId) -> Result<Task, LifecycleError> {
        let task = self
            .storage
            .get_task(task_id)
            .await?
            .ok_or(LifecycleError::TaskNotFound(*task_id))?;

        if &task.probe_id != caller {
            tracing::debug!(task_id = %task_id, caller = %caller, "task owned by another probe");
            return Err(LifecycleError::AccessDenied(*task_id));
        }
        Ok(task)
    }

    /// `ready` tasks for `probe` created at or after `since`.
    pub async fn get_tasks_for_user(
        &self,
        probe: &ProbeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, LifecycleError> {
        Ok(self.storage.list_ready_tasks_for_probe(probe, since).await?)
    }

    /// Move a task to `target` if it is currently in one of `allowed_from`.
    ///
    /// Checks existence, then ownership, then state. The write itself is a
    /// compare-and-swap against `allowed_from`, so a concurrent transition
    /// that lands between the check and the write turns into
    /// [`LifecycleError::InconsistentState`] and nothing is changed.
    pub async fn set_task_state(
        &self,
        task_id: &TaskId,
        caller: &ProbeId,
        target: TaskState,
        allowed_from: &[TaskState],
        field: TimestampField,
    ) -> Result<(), LifecycleError> {
        let task = self.get_task(task_id, caller).await?;

        if !allowed_from.contains(&task.state) {
            tracing::debug!(
                task_id = %task_id,
                current = %task.state,
                target = %target,
                "transition not allowed from current state"
            );
            return Err(LifecycleError::InconsistentState {
                task_id: *task_id,
                target,
            });
        }

        let now = self.clock.now();
        let changed = self
            .storage
            .transition_task_if(task_id, allowed_from, target, field, now)
            .await
            .map_err(|e| {
                tracing::error!(task_id = %task_id, error = %e, "failed to update task state");
                e
            })?;

        if !changed {
            tracing::debug!(task_id = %task_id, target = %target, "lost transition race");
            return Err(LifecycleError::InconsistentState {
                task_id: *task_id,
                target,
            });
        }

        self.event_bus
            .emit(Event::task_state_changed(*task_id, caller.clone(), target, now))
            .await;
        Ok(())
    }

    /// Apply a named transition from the table.
    pub async fn advance(
        &self,
        task_id: &TaskId,
        caller: &ProbeId,
        transition: Transition,
    ) -> Result<(), LifecycleError> {
        self.set_task_state(
            task_id,
            caller,
            transition.target(),
            transition.allowed_from(),
            transition.timestamp_field(),
        )
        .await
    }

    /// ready → notified
    pub async fn notify(&self, task_id: &TaskId, caller: &ProbeId) -> Result<(), LifecycleError> {
        self.advance(task_id, caller, Transition::Notify).await
    }

    /// ready | notified → accepted
    pub async fn accept(&self, task_id: &TaskId, caller: &ProbeId) -> Result<(), LifecycleError> {
        self.advance(task_id, caller, Transition::Accept).await
    }

    /// ready | notified | accepted → rejected
    pub async fn reject(&self, task_id: &TaskId, caller: &ProbeId) -> Result<(), LifecycleError> {
        self.advance(task_id, caller, Transition::Reject).await
    }

    /// accepted → done
    pub async fn done(&self, task_id: &TaskId, caller: &ProbeId) -> Result<(), LifecycleError> {
        self.advance(task_id, caller, Transition::Done).await
    }
}
