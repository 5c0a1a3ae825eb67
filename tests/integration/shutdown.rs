//! Shutdown integration tests.
//!
//! Shutdown stops every runner from starting another firing, lets a firing
//! that is already materializing finish within the shutdown timeout, and
//! aborts whatever is still running after that.

use crate::common::{FLEET, seed_probes, start_scheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use probe_scheduler::testing::{MockClock, base_time, job_data};
use probe_scheduler::{
    InMemoryStorage, Job, JobBookkeeping, JobId, JobStore, ProbeId, ProbeRecord, ProbeRegistry,
    Scheduler, SchedulerError, SchedulerState, StorageError, Target, Task, TaskId, TaskState,
    TaskStore, TimestampField,
};
use std::sync::Arc;
use std::time::Duration;

/// Storage whose task inserts take a fixed amount of (virtual) time.
struct SlowStorage {
    inner: InMemoryStorage,
    insert_delay: Duration,
}

impl SlowStorage {
    fn new(insert_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStorage::new(),
            insert_delay,
        })
    }
}

#[async_trait]
impl JobStore for SlowStorage {
    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StorageError> {
        self.inner.list_jobs().await
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StorageError> {
        self.inner.list_active_jobs().await
    }

    async fn update_job_bookkeeping(
        &self,
        id: &JobId,
        bookkeeping: &JobBookkeeping,
    ) -> Result<(), StorageError> {
        self.inner.update_job_bookkeeping(id, bookkeeping).await
    }
}

#[async_trait]
impl TaskStore for SlowStorage {
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        tokio::time::sleep(self.insert_delay).await;
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        self.inner.get_task(id).await
    }

    async fn list_ready_tasks_for_probe(
        &self,
        probe_id: &ProbeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        self.inner.list_ready_tasks_for_probe(probe_id, since).await
    }

    async fn list_tasks_for_probe(&self, probe_id: &ProbeId) -> Result<Vec<Task>, StorageError> {
        self.inner.list_tasks_for_probe(probe_id).await
    }

    async fn transition_task_if(
        &self,
        id: &TaskId,
        allowed_from: &[TaskState],
        target: TaskState,
        field: TimestampField,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.inner
            .transition_task_if(id, allowed_from, target, field, at)
            .await
    }
}

#[async_trait]
impl ProbeRegistry for SlowStorage {
    async fn register_probe(&self, probe: ProbeRecord) -> Result<(), StorageError> {
        self.inner.register_probe(probe).await
    }

    async fn resolve_targets(&self, target: &Target) -> Result<Vec<ProbeId>, StorageError> {
        self.inner.resolve_targets(target).await
    }
}

/// Test: Shutdown lets an in-flight firing finish and records it.
#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_firing() {
    let storage = SlowStorage::new(Duration::from_secs(5));
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let job_id = harness.handle.add_job(job_data("now/1h")).await.unwrap();
    // The first firing is now blocked in its insert.
    tokio::time::sleep(Duration::from_secs(1)).await;

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();

    let tasks = storage
        .list_tasks_for_probe(&ProbeId::new(FLEET[0].0))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    let job = storage.get_job(&job_id).await.unwrap();
    assert_eq!(job.bookkeeping.times_run, 1);
    assert!(!job.bookkeeping.is_done);
}

/// Test: Shutdown gives up after its timeout and aborts the firing.
#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_aborts_stuck_firing() {
    let storage = SlowStorage::new(Duration::from_secs(600));
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;

    let (handle, task) = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(clock)
        .with_shutdown_timeout(Duration::from_secs(2))
        .start()
        .await
        .unwrap();

    let job_id = handle.add_job(job_data("now/1h")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = tokio::time::Instant::now();
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(handle.state().await, SchedulerState::Stopped);

    // The aborted firing never completed, so it was not counted.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(
        storage
            .list_tasks_for_probe(&ProbeId::new(FLEET[0].0))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        storage.get_job(&job_id).await.unwrap().bookkeeping.times_run,
        0
    );
}

/// Test: Shutdown with no jobs completes immediately and is idempotent.
#[tokio::test(start_paused = true)]
async fn test_shutdown_with_no_jobs() {
    let storage = Arc::new(InMemoryStorage::new());
    let harness = start_scheduler(storage, Arc::new(MockClock::new(base_time()))).await;

    let started = tokio::time::Instant::now();
    harness.handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    harness.task.await.unwrap();

    // A second shutdown is a no-op.
    harness.handle.shutdown().await.unwrap();
    assert!(!harness.handle.is_running().await);
    assert!(matches!(
        harness.handle.list_jobs().await,
        Err(SchedulerError::NotRunning)
    ));
}

/// Test: No runner starts another firing once shutdown has been signalled.
#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_runner() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), FLEET, clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let mut ids = Vec::new();
    for expr in ["now/10m", "now/1h/24", "now/PT15M"] {
        ids.push(harness.handle.add_job(job_data(expr)).await.unwrap());
    }
    tokio::time::sleep(Duration::from_secs(35 * 60)).await;
    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();

    let before: Vec<u64> = {
        let mut counts = Vec::new();
        for id in &ids {
            counts.push(storage.get_job(id).await.unwrap().bookkeeping.times_run);
        }
        counts
    };
    assert_eq!(before, vec![4, 1, 3]);

    tokio::time::sleep(Duration::from_secs(6 * 3600)).await;
    for (id, expected) in ids.iter().zip(before) {
        assert_eq!(
            storage.get_job(id).await.unwrap().bookkeeping.times_run,
            expected
        );
    }
}
