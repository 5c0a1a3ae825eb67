//! probe-scheduler: recurring measurement jobs for a fleet of probes.
//!
//! Operators register [`Job`]s with a repeating schedule and a probe
//! [`Target`]. The [`Scheduler`] runs one timer loop per job and, on every
//! firing, creates a `ready` [`Task`] for each matching probe. Probes then
//! pull their tasks and move them through the lifecycle with
//! [`TaskLifecycle`], whose transitions are conditional updates in storage.

pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod lifecycle;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use api::{ApiConfig, ApiError, ApiState, build_router, create_api_state, start_server};
pub use config::{ConfigError, ConfigLoader, ServiceConfig, StorageConfig};
pub use crate::core::clock::{Clock, SystemClock};
pub use crate::core::job::{Job, JobBookkeeping, JobData, Target, TaskTemplate};
pub use crate::core::schedule::{RepeatCount, ScheduleError, ScheduleSpec};
pub use crate::core::task::{Task, TaskState, TimestampField, Transition};
pub use crate::core::types::{JobId, ProbeId, TaskId};
pub use events::{Event, EventBus, EventHandler, TracingHandler};
pub use lifecycle::{LifecycleError, TaskLifecycle};
pub use scheduler::{
    MaterializeError, MaterializeOutcome, Scheduler, SchedulerError, SchedulerHandle,
    SchedulerState, TaskMaterializer,
};
pub use storage::{
    InMemoryStorage, JobStore, ProbeRecord, ProbeRegistry, SqliteStorage, Storage, StorageError,
    TaskStore,
};
