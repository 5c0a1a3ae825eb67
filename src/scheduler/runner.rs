//! Per-job timer loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{RwLock, watch};

use crate::core::clock::Clock;
use crate::core::job::{Job, JobBookkeeping};
use crate::events::{Event, EventBus};
use crate::storage::Storage;

use super::materializer::TaskMaterializer;

/// Retry delay for a failed firing of a schedule without an interval.
const FAILED_FIRING_RETRY_SECS: i64 = 60;

const PERSIST_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const PERSIST_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Drives one job: sleeps until `next_run_at`, materializes, advances the
/// bookkeeping, repeats until the schedule is exhausted or shutdown is
/// signalled.
///
/// The bookkeeping lives behind a reader/writer lock shared with the
/// scheduler. The runner is the only writer; listings take the read side
/// and only ever see a state that storage already holds. Firing `n + 1`
/// never starts before firing `n`'s bookkeeping has been written back.
pub(crate) struct JobRunner<S> {
    job: Job,
    bookkeeping: Arc<RwLock<JobBookkeeping>>,
    storage: Arc<S>,
    materializer: TaskMaterializer<S>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    shutdown: watch::Receiver<bool>,
}

impl<S: Storage + 'static> JobRunner<S> {
    pub(crate) fn new(
        job: Job,
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        event_bus: Arc<EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let bookkeeping = Arc::new(RwLock::new(job.bookkeeping));
        let materializer = TaskMaterializer::new(Arc::clone(&storage), Arc::clone(&clock));
        Self {
            job,
            bookkeeping,
            storage,
            materializer,
            clock,
            event_bus,
            shutdown,
        }
    }

    /// Shared handle on the live bookkeeping.
    pub(crate) fn bookkeeping(&self) -> Arc<RwLock<JobBookkeeping>> {
        Arc::clone(&self.bookkeeping)
    }

    /// Run until done or shut down.
    pub(crate) async fn run(mut self) {
        let job_id = self.job.id;

        loop {
            let snapshot = *self.bookkeeping.read().await;
            if snapshot.is_done {
                tracing::debug!(job_id = %job_id, times_run = snapshot.times_run, "runner finished");
                return;
            }

            if !self.wait_until(snapshot.next_run_at).await {
                tracing::debug!(job_id = %job_id, "runner stopped by shutdown");
                return;
            }

            let firing = snapshot.times_run + 1;
            tracing::debug!(job_id = %job_id, firing, scheduled = %snapshot.next_run_at, "firing");

            let delivered = match self
                .materializer
                .materialize(&self.job.target, &self.job.task)
                .await
            {
                Ok(outcome) => {
                    self.event_bus
                        .emit(Event::job_fired(
                            job_id,
                            firing,
                            outcome.matched,
                            outcome.created,
                            self.clock.now(),
                        ))
                        .await;
                    true
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, firing, error = %e, "materialization failed");
                    self.event_bus
                        .emit(Event::firing_failed(job_id, firing, e.to_string(), self.clock.now()))
                        .await;
                    false
                }
            };

            let Some(updated) = self.advance(delivered).await else {
                tracing::warn!(job_id = %job_id, "runner stopped by shutdown with bookkeeping unsaved");
                return;
            };
            if updated.is_done {
                self.event_bus
                    .emit(Event::job_done(job_id, updated.times_run, self.clock.now()))
                    .await;
                tracing::info!(job_id = %job_id, times_run = updated.times_run, "job done");
                return;
            }
        }
    }

    /// Compute the bookkeeping that follows a firing, persist it, then
    /// publish it to the shared lock.
    ///
    /// Only a delivered firing counts. A failed one keeps `times_run` and is
    /// retried one interval later, so it can never finish the job.
    ///
    /// Returns `None` if shutdown was signalled while storage kept refusing
    /// the write.
    async fn advance(&mut self, delivered: bool) -> Option<JobBookkeeping> {
        let mut next = *self.bookkeeping.read().await;

        if delivered {
            next.times_run += 1;
            let (at, has_more) = self
                .job
                .schedule
                .next_fire_time(next.next_run_at, next.times_run);
            if has_more {
                next.next_run_at = at;
            } else {
                next.is_done = true;
            }
        } else {
            next.next_run_at = next
                .next_run_at
                .checked_add_signed(self.retry_interval())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        if !self.persist(&next).await {
            return None;
        }
        *self.bookkeeping.write().await = next;
        Some(next)
    }

    /// How long a failed firing waits before it is attempted again.
    fn retry_interval(&self) -> TimeDelta {
        let interval = self.job.schedule.interval();
        if interval > TimeDelta::zero() {
            interval
        } else {
            TimeDelta::seconds(FAILED_FIRING_RETRY_SECS)
        }
    }

    /// Write bookkeeping back, retrying with backoff until it sticks.
    ///
    /// Returns `false` if shutdown was signalled first.
    async fn persist(&mut self, bookkeeping: &JobBookkeeping) -> bool {
        let mut backoff = PERSIST_BACKOFF_INITIAL;
        loop {
            match self
                .storage
                .update_job_bookkeeping(&self.job.id, bookkeeping)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    tracing::error!(
                        job_id = %self.job.id,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "failed to persist job bookkeeping"
                    );
                }
            }

            if !self.pause(backoff).await {
                return false;
            }
            backoff = (backoff * 2).min(PERSIST_BACKOFF_MAX);
        }
    }

    /// Sleep until `deadline` by the injected clock.
    ///
    /// Returns `false` if shutdown was signalled first.
    async fn wait_until(&mut self, deadline: DateTime<Utc>) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return false;
            }

            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);

            if !self.pause(wait).await {
                return false;
            }
        }
    }

    /// Sleep for `duration` of runtime time, waking early on shutdown.
    ///
    /// Returns `false` if shutdown was signalled.
    async fn pause(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        let sender_alive = tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            // A dropped sender means the scheduler is gone.
            changed = self.shutdown.changed() => changed.is_ok(),
        };
        sender_alive && !*self.shutdown.borrow()
    }
}
