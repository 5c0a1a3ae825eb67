//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Accepting new jobs and persisting them before their first firing
//! - Running one [`JobRunner`] per active job
//! - Resuming unfinished jobs from storage on start
//! - Draining runners on shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::clock::{Clock, SystemClock};
use crate::core::job::{Job, JobBookkeeping, JobData};
use crate::core::types::JobId;
use crate::events::{Event, EventBus};
use crate::storage::{Storage, StorageError};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::runner::JobRunner;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};

/// Poll interval while waiting for runners to exit during shutdown.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A live runner and the bookkeeping it owns.
struct RunnerSlot {
    bookkeeping: Arc<RwLock<JobBookkeeping>>,
    handle: JoinHandle<()>,
}

/// The job scheduler.
///
/// Build it with the `with_*` methods, then call [`Scheduler::start`] to
/// spawn the command loop and get a [`SchedulerHandle`].
pub struct Scheduler<S: Storage> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            event_bus: Arc::new(EventBus::new()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the storage.
    pub fn storage(&self) -> Arc<S> {
        Arc::clone(&self.storage)
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    /// Start the scheduler and return a handle for controlling it.
    ///
    /// Every persisted job that is not done gets a runner again, picking up
    /// from its stored `times_run` and `next_run_at`. Overdue firings are
    /// caught up in order.
    pub async fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let active = self.storage.list_active_jobs().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let mut engine = Engine {
            storage: self.storage,
            clock: self.clock,
            event_bus: self.event_bus,
            shutdown_timeout: self.shutdown_timeout,
            shutdown_tx,
            runners: HashMap::new(),
        };

        for job in active {
            tracing::info!(
                job_id = %job.id,
                times_run = job.bookkeeping.times_run,
                next_run_at = %job.bookkeeping.next_run_at,
                "resuming job"
            );
            engine.spawn_runner(job);
        }

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            engine.run(command_rx, state).await;
        });

        Ok((handle, scheduler_task))
    }
}

/// State owned by the running command loop.
struct Engine<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    shutdown_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    runners: HashMap<JobId, RunnerSlot>,
}

impl<S: Storage + 'static> Engine<S> {
    /// Main command loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        while let Some(command) = command_rx.recv().await {
            self.reap_finished_runners();

            match command {
                SchedulerCommand::AddJob { data, response } => {
                    let result = self.add_job(data).await;
                    let _ = response.send(result);
                }
                SchedulerCommand::ListJobs { response } => {
                    let _ = response.send(self.list_jobs().await);
                }
                SchedulerCommand::JobStatus { job_id, response } => {
                    let _ = response.send(self.job_status(&job_id).await);
                }
                SchedulerCommand::Shutdown { response } => {
                    self.shutdown(&state).await;
                    let _ = response.send(());
                    return;
                }
            }
        }

        // Every handle was dropped.
        tracing::info!("all scheduler handles dropped, shutting down");
        self.shutdown(&state).await;
    }

    async fn add_job(&mut self, data: JobData) -> Result<JobId, SchedulerError> {
        let job = match Job::from_data(data, self.clock.as_ref()) {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(error = %e, "rejected job with malformed schedule");
                return Err(e.into());
            }
        };

        self.storage.insert_job(&job).await.map_err(|e| {
            tracing::error!(job_id = %job.id, error = %e, "failed to persist job");
            SchedulerError::from(e)
        })?;

        let job_id = job.id;
        let next_run_at = job.bookkeeping.next_run_at;
        tracing::info!(
            job_id = %job_id,
            schedule = %job.schedule,
            delay_secs = job.delay.num_seconds(),
            next_run_at = %next_run_at,
            "job registered"
        );
        self.event_bus
            .emit(Event::job_registered(job_id, next_run_at, self.clock.now()))
            .await;

        if job.bookkeeping.is_done {
            tracing::info!(job_id = %job_id, "job owes no firings, not starting a runner");
        } else {
            self.spawn_runner(job);
        }

        Ok(job_id)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut jobs = self.storage.list_jobs().await?;
        for job in &mut jobs {
            self.overlay_live_bookkeeping(job).await;
        }
        Ok(jobs)
    }

    async fn job_status(&self, job_id: &JobId) -> Result<Job, SchedulerError> {
        let mut job = match self.storage.get_job(job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound(_)) => {
                return Err(SchedulerError::JobNotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.overlay_live_bookkeeping(&mut job).await;
        Ok(job)
    }

    /// Replace stored bookkeeping with the runner's, if one is live.
    async fn overlay_live_bookkeeping(&self, job: &mut Job) {
        if let Some(slot) = self.runners.get(&job.id) {
            job.bookkeeping = *slot.bookkeeping.read().await;
        }
    }

    fn spawn_runner(&mut self, job: Job) {
        let job_id = job.id;
        let runner = JobRunner::new(
            job,
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            Arc::clone(&self.event_bus),
            self.shutdown_tx.subscribe(),
        );
        let bookkeeping = runner.bookkeeping();
        let handle = tokio::spawn(runner.run());
        self.runners.insert(
            job_id,
            RunnerSlot {
                bookkeeping,
                handle,
            },
        );
    }

    /// Drop slots whose runner has exited. Their final bookkeeping is in
    /// storage.
    fn reap_finished_runners(&mut self) {
        self.runners.retain(|_, slot| !slot.handle.is_finished());
    }

    async fn shutdown(&mut self, state: &RwLock<SchedulerState>) {
        *state.write().await = SchedulerState::Stopping;

        // Nobody may be subscribed if no runner was ever spawned.
        let _ = self.shutdown_tx.send(true);
        self.await_runners().await;

        *state.write().await = SchedulerState::Stopped;
        tracing::info!("scheduler stopped");
    }

    /// Wait for all runners to exit with a timeout, then abort stragglers.
    async fn await_runners(&mut self) {
        self.reap_finished_runners();
        let running_count = self.runners.len();

        if running_count == 0 {
            tracing::info!("No running jobs to wait for during shutdown");
            return;
        }

        tracing::info!(
            running = running_count,
            timeout = ?self.shutdown_timeout,
            "Graceful shutdown: waiting for runners to exit"
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            self.reap_finished_runners();
            let remaining = self.runners.len();

            if remaining == 0 {
                tracing::info!(elapsed = ?start.elapsed(), "All runners exited gracefully");
                return;
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining,
                    timeout = ?self.shutdown_timeout,
                    "Graceful shutdown timeout exceeded, aborting remaining runners"
                );
                for (job_id, slot) in self.runners.drain() {
                    tracing::warn!(job_id = %job_id, "aborting runner");
                    slot.handle.abort();
                }
                return;
            }

            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}
