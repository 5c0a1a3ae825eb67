//! Job definitions.
//!
//! A job pairs a [`ScheduleSpec`] with a probe [`Target`] and a
//! [`TaskTemplate`]. Every firing stamps the template onto one task per
//! matching probe.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clock::Clock;
use super::schedule::{ScheduleError, ScheduleSpec};
use super::types::JobId;

/// Probe selection filter.
///
/// An empty list places no restriction on that axis. Within an axis any
/// entry may match; both axes must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// ISO country codes, compared case-insensitively.
    #[serde(default)]
    pub countries: Vec<String>,
    /// Platform identifiers (`android`, `ios`, `linux`, ...).
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl Target {
    /// A target matching every probe.
    pub fn everyone() -> Self {
        Self::default()
    }

    /// Restrict to the given countries.
    pub fn with_countries<I, S>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.countries = countries.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given platforms.
    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    /// Canonical form: upper-case countries, lower-case platforms.
    pub fn normalized(&self) -> Self {
        Self {
            countries: self.countries.iter().map(|c| c.trim().to_uppercase()).collect(),
            platforms: self.platforms.iter().map(|p| p.trim().to_lowercase()).collect(),
        }
    }

    /// Whether a probe with this country and platform is selected.
    pub fn matches(&self, country: &str, platform: &str) -> bool {
        let country_ok = self.countries.is_empty()
            || self.countries.iter().any(|c| c.trim().eq_ignore_ascii_case(country));
        let platform_ok = self.platforms.is_empty()
            || self.platforms.iter().any(|p| p.trim().eq_ignore_ascii_case(platform));
        country_ok && platform_ok
    }
}

/// What each materialized task carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub test_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl TaskTemplate {
    pub fn new(test_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            test_name: test_name.into(),
            arguments,
        }
    }
}

/// A job submission as an operator writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Schedule expression, see [`ScheduleSpec`].
    pub schedule: String,
    /// Extra offset in seconds applied before the first firing.
    #[serde(default)]
    pub delay: i64,
    pub comment: String,
    pub task: TaskTemplate,
    #[serde(default)]
    pub target: Target,
}

/// Mutable run state of a job, owned by its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBookkeeping {
    /// Completed firings.
    pub times_run: u64,
    /// Instant of the next firing.
    pub next_run_at: DateTime<Utc>,
    /// Set once the schedule is exhausted.
    pub is_done: bool,
}

/// A registered job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub comment: String,
    pub schedule: ScheduleSpec,
    pub delay: TimeDelta,
    pub target: Target,
    pub task: TaskTemplate,
    pub creation_time: DateTime<Utc>,
    pub bookkeeping: JobBookkeeping,
}

impl Job {
    /// Build a new job from an operator submission.
    ///
    /// Parses the schedule and computes the first firing (start time plus
    /// delay). A schedule that owes no firings yields a job that is already
    /// done.
    pub fn from_data(data: JobData, clock: &dyn Clock) -> Result<Self, ScheduleError> {
        let now = clock.now();
        let schedule = ScheduleSpec::parse_at(&data.schedule, now)?;

        if data.delay < 0 {
            return Err(ScheduleError::Malformed(format!(
                "negative delay: {}",
                data.delay
            )));
        }
        let delay = TimeDelta::try_seconds(data.delay)
            .ok_or_else(|| ScheduleError::Malformed(format!("delay out of range: {}", data.delay)))?;

        let (first, has_more) = schedule.next_fire_time(schedule.start_time(), 0);
        let next_run_at = first
            .checked_add_signed(delay)
            .ok_or_else(|| ScheduleError::Malformed(format!("delay out of range: {}", data.delay)))?;

        Ok(Self {
            id: JobId::new(),
            comment: data.comment,
            schedule,
            delay,
            target: data.target.normalized(),
            task: data.task,
            creation_time: now,
            bookkeeping: JobBookkeeping {
                times_run: 0,
                next_run_at,
                is_done: !has_more,
            },
        })
    }

    /// The submission this job was created from.
    pub fn data(&self) -> JobData {
        JobData {
            schedule: self.schedule.expression().to_string(),
            delay: self.delay.num_seconds(),
            comment: self.comment.clone(),
            task: self.task.clone(),
            target: self.target.clone(),
        }
    }
}
