//! Lifecycle events and event handling.
//!
//! Runners and the task lifecycle report what happened through an
//! [`EventBus`]. The binary installs a [`TracingHandler`]; tests install
//! recording handlers from [`crate::testing`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::task::TaskState;
use crate::core::types::{JobId, ProbeId, TaskId};

/// Lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A job was accepted and its runner started.
    JobRegistered {
        job_id: JobId,
        next_run_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A firing completed its materialization.
    JobFired {
        job_id: JobId,
        /// 1-indexed firing number.
        firing: u64,
        /// Probes selected by the target filter.
        matched: usize,
        /// Tasks actually inserted.
        created: usize,
        timestamp: DateTime<Utc>,
    },

    /// A firing's materialization failed. The job keeps running.
    FiringFailed {
        job_id: JobId,
        firing: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The schedule is exhausted.
    JobDone {
        job_id: JobId,
        times_run: u64,
        timestamp: DateTime<Utc>,
    },

    /// A probe moved one of its tasks to a new state.
    TaskStateChanged {
        task_id: TaskId,
        probe_id: ProbeId,
        state: TaskState,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::JobRegistered { timestamp, .. } => *timestamp,
            Event::JobFired { timestamp, .. } => *timestamp,
            Event::FiringFailed { timestamp, .. } => *timestamp,
            Event::JobDone { timestamp, .. } => *timestamp,
            Event::TaskStateChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Job the event belongs to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobRegistered { job_id, .. }
            | Event::JobFired { job_id, .. }
            | Event::FiringFailed { job_id, .. }
            | Event::JobDone { job_id, .. } => Some(*job_id),
            Event::TaskStateChanged { .. } => None,
        }
    }

    /// Create a JobRegistered event.
    pub fn job_registered(job_id: JobId, next_run_at: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        Event::JobRegistered {
            job_id,
            next_run_at,
            timestamp: at,
        }
    }

    /// Create a JobFired event.
    pub fn job_fired(
        job_id: JobId,
        firing: u64,
        matched: usize,
        created: usize,
        at: DateTime<Utc>,
    ) -> Self {
        Event::JobFired {
            job_id,
            firing,
            matched,
            created,
            timestamp: at,
        }
    }

    /// Create a FiringFailed event.
    pub fn firing_failed(job_id: JobId, firing: u64, error: String, at: DateTime<Utc>) -> Self {
        Event::FiringFailed {
            job_id,
            firing,
            error,
            timestamp: at,
        }
    }

    /// Create a JobDone event.
    pub fn job_done(job_id: JobId, times_run: u64, at: DateTime<Utc>) -> Self {
        Event::JobDone {
            job_id,
            times_run,
            timestamp: at,
        }
    }

    /// Create a TaskStateChanged event.
    pub fn task_state_changed(
        task_id: TaskId,
        probe_id: ProbeId,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Self {
        Event::TaskStateChanged {
            task_id,
            probe_id,
            state,
            timestamp: at,
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes every event to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobRegistered {
                job_id,
                next_run_at,
                ..
            } => tracing::info!(job_id = %job_id, next_run_at = %next_run_at, "job registered"),
            Event::JobFired {
                job_id,
                firing,
                matched,
                created,
                ..
            } => tracing::info!(
                job_id = %job_id,
                firing,
                matched,
                created,
                "job fired"
            ),
            Event::FiringFailed {
                job_id,
                firing,
                error,
                ..
            } => tracing::warn!(job_id = %job_id, firing, error = %error, "firing failed"),
            Event::JobDone {
                job_id, times_run, ..
            } => tracing::info!(job_id = %job_id, times_run, "job done"),
            Event::TaskStateChanged {
                task_id,
                probe_id,
                state,
                ..
            } => tracing::info!(
                task_id = %task_id,
                probe_id = %probe_id,
                state = %state,
                "task state changed"
            ),
        }
    }
}
