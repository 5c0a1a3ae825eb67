//! Schedule parsing and fire time calculation.
//!
//! A schedule is written `START[/INTERVAL[/COUNT]]`:
//!
//! - `2024-01-15T12:00:00Z` fires once.
//! - `2024-01-15T12:00:00Z/PT1H` fires every hour, forever.
//! - `now/1h/3` fires three times, one hour apart, starting immediately.
//!
//! The ISO-8601 repeating-interval spelling `R[COUNT]/START/INTERVAL` is
//! accepted as an alias. Intervals are ISO-8601 durations (`PT1H`, `P1D`)
//! or the compact `1h30m` form.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use thiserror::Error;

use super::clock::Clock;

/// Errors that can occur when parsing a schedule.
///
/// Every variant is a malformed schedule; the variant names the segment that
/// could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The start segment is not an absolute instant.
    #[error("malformed schedule: invalid start time '{0}'")]
    InvalidStart(String),

    /// The repeat segment is not a positive duration.
    #[error("malformed schedule: invalid repeat interval '{0}'")]
    InvalidInterval(String),

    /// The repeat-count segment is not a non-negative integer.
    #[error("malformed schedule: invalid repeat count '{0}'")]
    InvalidRepeatCount(String),

    /// The expression does not have the `START[/INTERVAL[/COUNT]]` shape.
    #[error("malformed schedule: {0}")]
    Malformed(String),
}

/// How many times a schedule fires in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatCount {
    /// Fires forever.
    Unbounded,
    /// Fires exactly this many times.
    Times(u64),
}

impl fmt::Display for RepeatCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatCount::Unbounded => write!(f, "unbounded"),
            RepeatCount::Times(n) => write!(f, "{}", n),
        }
    }
}

/// A parsed, immutable schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    expression: String,
    start_time: DateTime<Utc>,
    interval: TimeDelta,
    repeat: RepeatCount,
}

impl ScheduleSpec {
    /// Parse a schedule, resolving `now` against the given clock.
    pub fn parse(expression: impl Into<String>, clock: &dyn Clock) -> Result<Self, ScheduleError> {
        Self::parse_at(expression, clock.now())
    }

    /// Parse a schedule, resolving `now` to the given instant.
    ///
    /// Re-parsing a stored expression with its stored start time yields the
    /// same schedule, which is how jobs are restored after a restart.
    pub fn parse_at(
        expression: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        if trimmed.is_empty() {
            return Err(ScheduleError::Malformed("empty schedule".into()));
        }

        let segments: Vec<&str> = trimmed.split('/').collect();

        let (start, interval, repeat) = match segments.as_slice() {
            [first, start, interval] if is_iso_repeat(first) => {
                let repeat = match &first[1..] {
                    "" => RepeatCount::Unbounded,
                    count => RepeatCount::Times(parse_repeat_count(count)?),
                };
                (parse_start(start, now)?, parse_interval(interval)?, repeat)
            }
            [start] => (parse_start(start, now)?, TimeDelta::zero(), RepeatCount::Times(1)),
            [start, interval] => (
                parse_start(start, now)?,
                parse_interval(interval)?,
                RepeatCount::Unbounded,
            ),
            [start, interval, count] => (
                parse_start(start, now)?,
                parse_interval(interval)?,
                RepeatCount::Times(parse_repeat_count(count)?),
            ),
            _ => {
                return Err(ScheduleError::Malformed(format!(
                    "expected at most 3 segments, got {}",
                    segments.len()
                )));
            }
        };

        Ok(Self {
            start_time: start,
            interval,
            repeat,
            expression: trimmed.to_string(),
        })
    }

    /// Compute the next fire time.
    ///
    /// With `firings_so_far == 0` this is the start time. Afterwards it is
    /// `previous + interval`. The flag reports whether that instant is a
    /// firing the schedule still owes.
    pub fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        firings_so_far: u64,
    ) -> (DateTime<Utc>, bool) {
        if firings_so_far == 0 {
            return (self.start_time, self.repeat != RepeatCount::Times(0));
        }

        let has_more = match self.repeat {
            RepeatCount::Unbounded => true,
            RepeatCount::Times(n) => firings_so_far < n,
        };

        match previous.checked_add_signed(self.interval) {
            Some(next) => (next, has_more),
            None => (DateTime::<Utc>::MAX_UTC, false),
        }
    }

    /// The first `limit` fire times, offset by `delay`.
    pub fn upcoming(&self, delay: TimeDelta, limit: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(limit);
        let (first, mut has_more) = self.next_fire_time(self.start_time, 0);
        let mut current = first + delay;
        let mut fired = 0;

        while has_more && times.len() < limit {
            times.push(current);
            fired += 1;
            let (next, more) = self.next_fire_time(current, fired);
            current = next;
            has_more = more;
        }

        times
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The instant of the first firing (before any job delay).
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// The repetition interval; zero for one-shot schedules.
    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Total number of firings.
    pub fn repeat_count(&self) -> RepeatCount {
        self.repeat
    }

    /// Whether the schedule fires more than once.
    pub fn is_repeating(&self) -> bool {
        match self.repeat {
            RepeatCount::Unbounded => true,
            RepeatCount::Times(n) => n > 1,
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn is_iso_repeat(segment: &str) -> bool {
    segment
        .strip_prefix('R')
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

fn parse_start(segment: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let segment = segment.trim();
    if segment.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    DateTime::parse_from_rfc3339(segment)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ScheduleError::InvalidStart(segment.to_string()))
}

fn parse_repeat_count(segment: &str) -> Result<u64, ScheduleError> {
    let segment = segment.trim();
    if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_digit()) {
        return Err(ScheduleError::InvalidRepeatCount(segment.to_string()));
    }
    segment
        .parse()
        .map_err(|_| ScheduleError::InvalidRepeatCount(segment.to_string()))
}

/// Parse an interval: ISO-8601 (`PT1H`) or compact (`1h30m`).
pub(crate) fn parse_interval(segment: &str) -> Result<TimeDelta, ScheduleError> {
    let segment = segment.trim();
    let seconds = if let Some(body) = segment.strip_prefix('P') {
        parse_iso8601_seconds(body)
    } else {
        parse_compact_seconds(segment)
    }
    .ok_or_else(|| ScheduleError::InvalidInterval(segment.to_string()))?;

    if seconds <= 0 {
        return Err(ScheduleError::InvalidInterval(segment.to_string()));
    }

    TimeDelta::try_seconds(seconds).ok_or_else(|| ScheduleError::InvalidInterval(segment.to_string()))
}

/// `nW`, `nD` and a `T` section with `nH`, `nM`, `nS`. Years and months
/// have no fixed length and are rejected.
fn parse_iso8601_seconds(body: &str) -> Option<i64> {
    let mut total: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    let mut components = 0;
    let mut time_components = 0;

    for c in body.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        if c == 'T' && !in_time && number.is_empty() {
            in_time = true;
            continue;
        }

        let value: i64 = number.parse().ok()?;
        number.clear();

        let unit = match (in_time, c) {
            (false, 'W') => 604_800,
            (false, 'D') => 86_400,
            (true, 'H') => 3_600,
            (true, 'M') => 60,
            (true, 'S') => 1,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
        components += 1;
        if in_time {
            time_components += 1;
        }
    }

    // `T` must introduce at least one time component.
    if !number.is_empty() || components == 0 || (in_time && time_components == 0) {
        return None;
    }
    Some(total)
}

/// `30s`, `5m`, `1h30m`, `1d`.
fn parse_compact_seconds(s: &str) -> Option<i64> {
    let mut total: i64 = 0;
    let mut number = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }

        let value: i64 = number.parse().ok()?;
        number.clear();

        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }

    if !number.is_empty() {
        return None;
    }
    Some(total)
}
