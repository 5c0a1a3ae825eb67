//! Source of the current instant.
//!
//! Everything that stamps or compares wall-clock time goes through a
//! [`Clock`] so runners and schedules can be driven deterministically in
//! tests (see `testing::MockClock`).

use chrono::{DateTime, Utc};

/// A source of the current absolute instant.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
