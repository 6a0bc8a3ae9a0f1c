//! Taskset types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::TasksetId;
use crate::status::TasksetStatus;
use crate::task::NewTask;
use crate::timeout::TimeoutPolicy;

/// One test-suite run and its aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taskset {
    /// Unique taskset identifier.
    pub id: TasksetId,

    /// Current taskset status.
    pub status: TasksetStatus,

    /// Owner name used for rsync and for "cancel all of mine".
    pub rsync_name: String,

    /// Command executors run once before taking tasks.
    pub setup_command: String,

    /// Command executors run per slave process.
    pub slave_command: String,

    /// Kind of executor this taskset asks for.
    pub worker_type: String,

    /// Upper bound on executors working this taskset at once.
    pub max_workers: u32,

    /// Failure-class trials a task may accumulate before it fails.
    pub max_trials: u32,

    /// Logical executor profile; scopes duration estimates.
    pub taskset_class: String,

    /// When the taskset was created.
    pub created_at: DateTime<Utc>,

    /// When the taskset reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// Aggregated log, append-only.
    pub log: String,
}

impl Taskset {
    /// Build a fresh taskset record in `rsync_waiting`.
    pub fn new(id: TasksetId, spec: &NewTaskset, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TasksetStatus::RsyncWaiting,
            rsync_name: spec.rsync_name.clone(),
            setup_command: spec.setup_command.clone(),
            slave_command: spec.slave_command.clone(),
            worker_type: spec.worker_type.clone(),
            max_workers: spec.max_workers,
            max_trials: spec.max_trials,
            taskset_class: spec.taskset_class.clone(),
            created_at,
            finished_at: None,
            log: String::new(),
        }
    }

    /// Check if the taskset is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Everything a client supplies to start a taskset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskset {
    pub rsync_name: String,
    #[serde(default)]
    pub setup_command: String,
    #[serde(default)]
    pub slave_command: String,
    pub worker_type: String,
    pub max_workers: u32,
    pub max_trials: u32,
    pub taskset_class: String,
    /// How per-task timeouts are sized from duration history.
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    pub tasks: Vec<NewTask>,
}

impl NewTaskset {
    /// Reject requests the scheduler could never finish.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.rsync_name.trim().is_empty() {
            return Err(CoreError::InvalidInput("rsync_name must not be empty".into()));
        }
        if self.taskset_class.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "taskset_class must not be empty".into(),
            ));
        }
        if self.max_trials == 0 {
            return Err(CoreError::InvalidInput("max_trials must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(CoreError::InvalidInput(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(CoreError::InvalidInput("taskset has no tasks".into()));
        }
        if let Some(task) = self.tasks.iter().find(|t| t.spec_file.is_empty()) {
            return Err(CoreError::InvalidInput(format!(
                "task with content hash '{}' has no spec file",
                task.content_hash
            )));
        }
        Ok(())
    }
}
