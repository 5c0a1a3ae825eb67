//! Job scheduling.
//!
//! The [`Scheduler`] owns one timer loop per active job. Each firing asks
//! the [`TaskMaterializer`] to turn the job's target into tasks.

mod engine;
mod handle;
mod materializer;
mod runner;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use materializer::{MaterializeError, MaterializeOutcome, TaskMaterializer};
pub use types::{SchedulerError, SchedulerState};
