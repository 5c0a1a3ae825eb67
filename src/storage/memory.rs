//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{JobStore, ProbeRecord, ProbeRegistry, StorageError, TaskStore};
use crate::core::job::{Job, JobBookkeeping, Target};
use crate::core::task::{Task, TaskState, TimestampField};
use crate::core::types::{JobId, ProbeId, TaskId};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts. Conditional task updates run
/// under the tasks write lock, so they have the same compare-and-swap
/// semantics as the SQL backend.
pub struct InMemoryStorage {
    jobs: RwLock<HashMap<JobId, Job>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    probes: RwLock<BTreeMap<ProbeId, ProbeRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            probes: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_jobs<'a>(jobs: impl Iterator<Item = &'a Job>) -> Vec<Job> {
    let mut result: Vec<_> = jobs.cloned().collect();
    result.sort_by(|a, b| {
        a.creation_time
            .cmp(&b.creation_time)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
    result
}

fn sorted_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Vec<Task> {
    let mut result: Vec<_> = tasks.cloned().collect();
    result.sort_by(|a, b| {
        a.creation_time
            .cmp(&b.creation_time)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
    result
}

#[async_trait]
impl JobStore for InMemoryStorage {
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sorted_jobs(jobs.values()))
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sorted_jobs(jobs.values().filter(|j| !j.bookkeeping.is_done)))
    }

    async fn update_job_bookkeeping(
        &self,
        id: &JobId,
        bookkeeping: &JobBookkeeping,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job.bookkeeping = *bookkeeping;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStorage {
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(StorageError::DuplicateKey(format!("task: {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tasks.get(id).cloned())
    }

    async fn list_ready_tasks_for_probe(
        &self,
        probe_id: &ProbeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sorted_tasks(tasks.values().filter(|t| {
            t.state == TaskState::Ready && &t.probe_id == probe_id && t.creation_time >= since
        })))
    }

    async fn list_tasks_for_probe(&self, probe_id: &ProbeId) -> Result<Vec<Task>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sorted_tasks(
            tasks.values().filter(|t| &t.probe_id == probe_id),
        ))
    }

    async fn transition_task_if(
        &self,
        id: &TaskId,
        allowed_from: &[TaskState],
        target: TaskState,
        field: TimestampField,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        match tasks.get_mut(id) {
            Some(task) if allowed_from.contains(&task.state) => {
                task.apply(target, field, at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ProbeRegistry for InMemoryStorage {
    async fn register_probe(&self, probe: ProbeRecord) -> Result<(), StorageError> {
        let mut probes = self.probes.write().map_err(|_| StorageError::LockPoisoned)?;
        probes.insert(probe.id.clone(), probe);
        Ok(())
    }

    async fn resolve_targets(&self, target: &Target) -> Result<Vec<ProbeId>, StorageError> {
        let probes = self.probes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(probes
            .values()
            .filter(|p| target.matches(&p.country, &p.platform))
            .map(|p| p.id.clone())
            .collect())
    }
}
