//! Push events, one per entity-state transition.
//!
//! Peers may see the same entity's updates duplicated or reordered; the
//! `timestamp` on each event is the authority, not arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reference::Reference;
use crate::status::{SlaveStatus, TaskStatus, TasksetStatus, TrialStatus};

/// Changed fields of a Taskset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksetChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TasksetStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TasksetChanges {
    /// True when this update reports the taskset's terminal finish.
    pub fn is_terminal_finish(&self) -> bool {
        self.finished_at.is_some() && self.status.is_some_and(|s| s.is_terminal())
    }
}

/// Changed fields of a Task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Changed fields of a Slave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaveChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SlaveStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Changed fields of a WorkerLog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerLogChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rspec_finished_at: Option<DateTime<Utc>>,
}

/// A state transition pushed to subscribed peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushEvent {
    TasksetUpdated {
        timestamp: DateTime<Utc>,
        taskset: Reference,
        changes: TasksetChanges,
    },
    TaskUpdated {
        timestamp: DateTime<Utc>,
        task: Reference,
        changes: TaskChanges,
    },
    TrialCreated {
        timestamp: DateTime<Utc>,
        trial: Reference,
        task: Reference,
        slave: Reference,
        created_at: DateTime<Utc>,
    },
    TrialUpdated {
        timestamp: DateTime<Utc>,
        trial: Reference,
        task: Reference,
        finished_at: Option<DateTime<Utc>>,
        status: TrialStatus,
        passed: u32,
        pending: u32,
        failed: u32,
    },
    WorkerLogCreated {
        timestamp: DateTime<Utc>,
        worker_log: Reference,
        worker_name: String,
    },
    WorkerLogUpdated {
        timestamp: DateTime<Utc>,
        worker_log: Reference,
        changes: WorkerLogChanges,
    },
    SlaveCreated {
        timestamp: DateTime<Utc>,
        slave: Reference,
        name: String,
    },
    SlaveUpdated {
        timestamp: DateTime<Utc>,
        slave: Reference,
        changes: SlaveChanges,
    },
}

impl PushEvent {
    /// When the transition happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::TasksetUpdated { timestamp, .. }
            | Self::TaskUpdated { timestamp, .. }
            | Self::TrialCreated { timestamp, .. }
            | Self::TrialUpdated { timestamp, .. }
            | Self::WorkerLogCreated { timestamp, .. }
            | Self::WorkerLogUpdated { timestamp, .. }
            | Self::SlaveCreated { timestamp, .. }
            | Self::SlaveUpdated { timestamp, .. } => *timestamp,
        }
    }

    /// The entity whose state changed.
    pub fn subject(&self) -> Reference {
        match self {
            Self::TasksetUpdated { taskset, .. } => *taskset,
            Self::TaskUpdated { task, .. } => *task,
            Self::TrialCreated { trial, .. } | Self::TrialUpdated { trial, .. } => *trial,
            Self::WorkerLogCreated { worker_log, .. }
            | Self::WorkerLogUpdated { worker_log, .. } => *worker_log,
            Self::SlaveCreated { slave, .. } | Self::SlaveUpdated { slave, .. } => *slave,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TasksetUpdated { .. } => "taskset_updated",
            Self::TaskUpdated { .. } => "task_updated",
            Self::TrialCreated { .. } => "trial_created",
            Self::TrialUpdated { .. } => "trial_updated",
            Self::WorkerLogCreated { .. } => "worker_log_created",
            Self::WorkerLogUpdated { .. } => "worker_log_updated",
            Self::SlaveCreated { .. } => "slave_created",
            Self::SlaveUpdated { .. } => "slave_updated",
        }
    }
}
