//! Tasks addressed to a single probe and their legal state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::types::{ProbeId, TaskId};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created by a job firing, waiting for the probe to pick it up.
    Ready,
    /// The probe has been told about the task.
    Notified,
    /// The probe agreed to run the task.
    Accepted,
    /// The probe declined the task. Terminal.
    Rejected,
    /// The probe finished the task. Terminal.
    Done,
}

impl TaskState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Notified => "notified",
            TaskState::Accepted => "accepted",
            TaskState::Rejected => "rejected",
            TaskState::Done => "done",
        }
    }

    /// Whether no further transition can leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Rejected | TaskState::Done)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(TaskState::Ready),
            "notified" => Ok(TaskState::Notified),
            "accepted" => Ok(TaskState::Accepted),
            "rejected" => Ok(TaskState::Rejected),
            "done" => Ok(TaskState::Done),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// Timestamp column stamped by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    NotifyTime,
    AcceptTime,
    DoneTime,
}

impl TimestampField {
    /// Column name in the tasks table.
    pub fn column(&self) -> &'static str {
        match self {
            TimestampField::NotifyTime => "notify_time",
            TimestampField::AcceptTime => "accept_time",
            TimestampField::DoneTime => "done_time",
        }
    }
}

/// A named edge of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// ready → notified
    Notify,
    /// ready | notified → accepted
    Accept,
    /// ready | notified | accepted → rejected
    Reject,
    /// accepted → done
    Done,
}

impl Transition {
    /// State the task ends up in.
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Notify => TaskState::Notified,
            Transition::Accept => TaskState::Accepted,
            Transition::Reject => TaskState::Rejected,
            Transition::Done => TaskState::Done,
        }
    }

    /// States the transition may start from.
    pub fn allowed_from(&self) -> &'static [TaskState] {
        match self {
            Transition::Notify => &[TaskState::Ready],
            Transition::Accept => &[TaskState::Ready, TaskState::Notified],
            Transition::Reject => &[TaskState::Ready, TaskState::Notified, TaskState::Accepted],
            Transition::Done => &[TaskState::Accepted],
        }
    }

    /// Timestamp column updated alongside the state.
    pub fn timestamp_field(&self) -> TimestampField {
        match self {
            Transition::Notify => TimestampField::NotifyTime,
            Transition::Accept => TimestampField::AcceptTime,
            Transition::Reject | Transition::Done => TimestampField::DoneTime,
        }
    }
}

/// A unit of work addressed to exactly one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub probe_id: ProbeId,
    pub test_name: String,
    /// Opaque payload copied verbatim from the job's task template.
    pub arguments: Value,
    pub state: TaskState,
    pub creation_time: DateTime<Utc>,
    pub notify_time: Option<DateTime<Utc>>,
    pub accept_time: Option<DateTime<Utc>>,
    pub done_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl Task {
    /// Create a fresh `ready` task.
    pub fn new(
        probe_id: ProbeId,
        test_name: impl Into<String>,
        arguments: Value,
        creation_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            probe_id,
            test_name: test_name.into(),
            arguments,
            state: TaskState::Ready,
            creation_time,
            notify_time: None,
            accept_time: None,
            done_time: None,
            last_updated: creation_time,
        }
    }

    /// Apply a state change and stamp the matching timestamp.
    ///
    /// Storage backends call this after their own guard has passed.
    pub fn apply(&mut self, target: TaskState, field: TimestampField, at: DateTime<Utc>) {
        self.state = target;
        match field {
            TimestampField::NotifyTime => self.notify_time = Some(at),
            TimestampField::AcceptTime => self.accept_time = Some(at),
            TimestampField::DoneTime => self.done_time = Some(at),
        }
        self.last_updated = at;
    }
}
