//! Storage abstraction for jobs, tasks and the probe registry.
//!
//! Backends implement three narrow traits; anything implementing all of
//! them is a [`Storage`]. Two backends ship with the crate: an in-memory
//! one for tests and development, and SQLite.

mod memory;
mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::job::{Job, JobBookkeeping, Target};
use crate::core::task::{Task, TaskState, TimestampField};
use crate::core::types::{JobId, ProbeId, TaskId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// A probe known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub id: ProbeId,
    /// Upper-case ISO country code.
    pub country: String,
    /// Lower-case platform identifier.
    pub platform: String,
    pub registered_at: DateTime<Utc>,
}

impl ProbeRecord {
    /// Create a record, normalizing country and platform.
    pub fn new(
        id: impl Into<ProbeId>,
        country: &str,
        platform: &str,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            country: country.trim().to_uppercase(),
            platform: platform.trim().to_lowercase(),
            registered_at,
        }
    }
}

/// Persistence boundary for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The write is atomic: either the whole row exists
    /// afterwards or nothing does.
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// Jobs not yet marked done, oldest first.
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// Overwrite a job's run bookkeeping.
    async fn update_job_bookkeeping(
        &self,
        id: &JobId,
        bookkeeping: &JobBookkeeping,
    ) -> Result<(), StorageError>;
}

/// Persistence boundary for tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a freshly materialized task.
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError>;

    /// Get a task by ID, `None` if no such row exists.
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError>;

    /// `ready` tasks for a probe created at or after `since`, oldest first.
    async fn list_ready_tasks_for_probe(
        &self,
        probe_id: &ProbeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError>;

    /// Every task addressed to a probe regardless of state, oldest first.
    async fn list_tasks_for_probe(&self, probe_id: &ProbeId) -> Result<Vec<Task>, StorageError>;

    /// Compare-and-swap a task's state.
    ///
    /// Moves the task to `target` and stamps `field` and `last_updated` with
    /// `at`, but only if its current state is one of `allowed_from`. Returns
    /// whether exactly one row changed. Concurrent callers racing on the
    /// same task see at most one `true`.
    async fn transition_task_if(
        &self,
        id: &TaskId,
        allowed_from: &[TaskState],
        target: TaskState,
        field: TimestampField,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Lookup of the current probe population.
#[async_trait]
pub trait ProbeRegistry: Send + Sync {
    /// Insert or replace a probe.
    async fn register_probe(&self, probe: ProbeRecord) -> Result<(), StorageError>;

    /// Probes matching a target filter, ordered by id.
    async fn resolve_targets(&self, target: &Target) -> Result<Vec<ProbeId>, StorageError>;
}

/// A complete backend.
pub trait Storage: JobStore + TaskStore + ProbeRegistry {}

impl<T: JobStore + TaskStore + ProbeRegistry> Storage for T {}
