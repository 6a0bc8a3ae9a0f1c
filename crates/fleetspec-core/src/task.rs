//! Task and Trial types, and the rule that turns trials into a task verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{SlaveId, TaskId, TasksetId, TrialId};
use crate::status::{TaskStatus, TrialStatus};

/// One schedulable unit of work (one spec file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Owning taskset.
    pub taskset_id: TasksetId,

    /// Current task status.
    pub status: TaskStatus,

    /// Spec file the executor runs.
    pub spec_file: String,

    /// Hash of the spec file content; keys duration estimates.
    pub content_hash: String,

    /// Executor kills the trial after this many seconds.
    pub hard_timeout_sec: u64,

    /// Executor reports a timeout after this many seconds.
    pub soft_timeout_sec: u64,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// A task as supplied when a taskset is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub spec_file: String,
    pub content_hash: String,
}

impl NewTask {
    pub fn new(spec_file: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            spec_file: spec_file.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// One execution attempt of a Task on one Slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub task_id: TaskId,
    pub slave_id: SlaveId,
    pub status: TrialStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub passed: u32,
    pub pending: u32,
    pub failed: u32,
}

impl Trial {
    /// Build a fresh, unfinished trial.
    pub fn new(id: TrialId, task_id: TaskId, slave_id: SlaveId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            slave_id,
            status: TrialStatus::Unfinished,
            created_at,
            started_at: None,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            passed: 0,
            pending: 0,
            failed: 0,
        }
    }

    /// Wall-clock run time, when both ends were recorded.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }

    /// Apply the executor's result report.
    pub fn finish(&mut self, report: TrialReport, finished_at: DateTime<Utc>) {
        self.status = report.status;
        self.stdout = report.stdout;
        self.stderr = report.stderr;
        self.passed = report.passed;
        self.pending = report.pending;
        self.failed = report.failed;
        self.finished_at = Some(finished_at);
    }
}

/// An executor's result report for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub status: TrialStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub failed: u32,
}

impl TrialReport {
    pub fn new(status: TrialStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            passed: 0,
            pending: 0,
            failed: 0,
        }
    }

    /// A report must carry a finished status.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.status.is_finished() {
            Ok(())
        } else {
            Err(CoreError::InvalidInput(
                "trial report must carry a finished status".into(),
            ))
        }
    }
}

/// What a task's trials add up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskVerdict {
    /// Some trial passed.
    Passed,
    /// No trial passed, some trial is pending.
    Pending,
    /// Another trial is still in flight.
    InFlight,
    /// Never dispatched.
    NotStarted,
    /// Every trial failed, retry budget left.
    Retry { failures: u32 },
    /// Every trial failed and the budget is spent.
    Exhausted { failures: u32 },
}

impl TaskVerdict {
    /// Status the task moves to, if this verdict finishes it.
    pub fn finished_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Passed => Some(TaskStatus::Passed),
            Self::Pending => Some(TaskStatus::Pending),
            Self::Exhausted { .. } => Some(TaskStatus::Failed),
            Self::InFlight | Self::NotStarted | Self::Retry { .. } => None,
        }
    }
}

/// Aggregate trial statuses into a verdict.
///
/// Precedence: passed, then pending, then in flight; only when every trial
/// has a failure-class status is the retry budget consulted.
pub fn evaluate_trials<I>(statuses: I, max_trials: u32) -> TaskVerdict
where
    I: IntoIterator<Item = TrialStatus>,
{
    let statuses: Vec<TrialStatus> = statuses.into_iter().collect();

    if statuses.contains(&TrialStatus::Passed) {
        return TaskVerdict::Passed;
    }
    if statuses.contains(&TrialStatus::Pending) {
        return TaskVerdict::Pending;
    }
    if statuses.contains(&TrialStatus::Unfinished) {
        return TaskVerdict::InFlight;
    }
    if statuses.is_empty() {
        return TaskVerdict::NotStarted;
    }

    let failures = statuses.iter().filter(|s| s.is_failure_class()).count() as u32;
    if failures >= max_trials {
        TaskVerdict::Exhausted { failures }
    } else {
        TaskVerdict::Retry { failures }
    }
}
