//! Testing utilities for users of the library.
//!
//! - [`MockClock`]: a [`Clock`] driven by tokio's virtual time
//! - [`RecordingHandler`] / [`CountingHandler`]: event handlers that capture
//!   what the scheduler reports
//! - [`FlakyStorage`]: wraps a backend and fails writes on demand
//! - [`job_data`]: a ready-made job submission

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

use crate::core::clock::Clock;
use crate::core::job::{Job, JobBookkeeping, JobData, Target, TaskTemplate};
use crate::core::task::{Task, TaskState, TimestampField};
use crate::core::types::{JobId, ProbeId, TaskId};
use crate::events::{Event, EventHandler};
use crate::storage::{JobStore, ProbeRecord, ProbeRegistry, StorageError, TaskStore};

/// A clock for deterministic tests.
///
/// A following clock reports `base + elapsed tokio time`, so under
/// `#[tokio::test(start_paused = true)]` wall time moves exactly as far as
/// the runtime's virtual clock auto-advances. A frozen clock only moves
/// through [`MockClock::advance`].
///
/// # Example
///
/// ```
/// use chrono::{TimeDelta, TimeZone, Utc};
/// use probe_scheduler::core::clock::Clock;
/// use probe_scheduler::testing::MockClock;
///
/// let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let clock = MockClock::frozen(start);
/// clock.advance(TimeDelta::minutes(5));
/// assert_eq!(clock.now(), start + TimeDelta::minutes(5));
/// ```
pub struct MockClock {
    base: DateTime<Utc>,
    started: Option<tokio::time::Instant>,
    offset: StdMutex<TimeDelta>,
}

impl MockClock {
    /// A clock that starts at `base` and follows tokio time.
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Some(tokio::time::Instant::now()),
            offset: StdMutex::new(TimeDelta::zero()),
        }
    }

    /// A clock that stays at `at` until advanced.
    pub fn frozen(at: DateTime<Utc>) -> Self {
        Self {
            base: at,
            started: None,
            offset: StdMutex::new(TimeDelta::zero()),
        }
    }

    /// Move wall time forward without touching tokio time.
    pub fn advance(&self, delta: TimeDelta) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = self
            .started
            .map(|started| TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::MAX))
            .unwrap_or_else(TimeDelta::zero);
        self.base + elapsed + offset
    }
}

/// The instant most tests treat as "now": 2024-01-15T12:00:00Z.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A frozen clock at [`base_time`].
pub fn fixed_clock() -> MockClock {
    MockClock::frozen(base_time())
}

/// A job submission with the given schedule, no delay and an empty target.
pub fn job_data(schedule: &str) -> JobData {
    JobData {
        schedule: schedule.to_string(),
        delay: 0,
        comment: format!("test job {}", schedule),
        task: TaskTemplate::new(
            "web_connectivity",
            json!({"urls": ["https://example.org", "https://example.com"]}),
        ),
        target: Target::everyone(),
    }
}

/// Event handler that records received events.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Everything received so far, in order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Received events for one job.
    pub async fn events_for(&self, job_id: JobId) -> Vec<Event> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id() == Some(job_id))
            .cloned()
            .collect()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Event handler that counts events.
pub struct CountingHandler {
    count: AtomicU32,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &Event) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wraps a backend and makes selected writes fail.
///
/// Inserts fail for every probe listed with [`FlakyStorage::fail_probe`]
/// and for the next `n` inserts after [`FlakyStorage::fail_next_inserts`].
/// Target resolution and job bookkeeping writes have their own switches.
/// Everything else is delegated unchanged.
pub struct FlakyStorage<S> {
    inner: S,
    failing_probes: StdMutex<HashSet<ProbeId>>,
    pending_failures: AtomicUsize,
    registry_down: AtomicBool,
    pending_bookkeeping_failures: AtomicUsize,
}

impl<S> FlakyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_probes: StdMutex::new(HashSet::new()),
            pending_failures: AtomicUsize::new(0),
            registry_down: AtomicBool::new(false),
            pending_bookkeeping_failures: AtomicUsize::new(0),
        }
    }

    /// Fail every task insert addressed to this probe.
    pub fn fail_probe(&self, probe: impl Into<ProbeId>) {
        self.failing_probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(probe.into());
    }

    /// Fail the next `n` task inserts regardless of probe.
    pub fn fail_next_inserts(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Make target resolution fail until called again with `false`.
    pub fn set_registry_down(&self, down: bool) {
        self.registry_down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` job bookkeeping writes.
    pub fn fail_next_bookkeeping_writes(&self, n: usize) {
        self.pending_bookkeeping_failures.store(n, Ordering::SeqCst);
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self, probe: &ProbeId) -> bool {
        take_one(&self.pending_failures)
            || self
                .failing_probes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(probe)
    }
}

/// Decrement a pending-failure counter; `true` if one was left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<S: JobStore> JobStore for FlakyStorage<S> {
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
        if take_one(&self.pending_bookkeeping_failures) {
            return Err(StorageError::Other(format!(
                "injected bookkeeping write failure for job {}",
                id
            )));
        }
        self.inner.update_job_bookkeeping(id, bookkeeping).await
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for FlakyStorage<S> {
    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        if self.should_fail(&task.probe_id) {
            return Err(StorageError::Other(format!(
                "injected insert failure for probe {}",
                task.probe_id
            )));
        }
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
impl<S: ProbeRegistry> ProbeRegistry for FlakyStorage<S> {
    async fn register_probe(&self, probe: ProbeRecord) -> Result<(), StorageError> {
        self.inner.register_probe(probe).await
    }

    async fn resolve_targets(&self, target: &Target) -> Result<Vec<ProbeId>, StorageError> {
        if self.registry_down.load(Ordering::SeqCst) {
            return Err(StorageError::Other("probe registry unavailable".into()));
        }
        self.inner.resolve_targets(target).await
    }
}
