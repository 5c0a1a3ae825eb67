//! Domain types: identifiers, schedules, jobs, and probe tasks.

pub mod clock;
pub mod job;
pub mod schedule;
pub mod task;
pub mod types;
