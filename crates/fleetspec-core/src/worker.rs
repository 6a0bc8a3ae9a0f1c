//! Executor-side records: durable Slaves and WorkerLogs, and the
//! ephemeral worker liveness snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SlaveId, TasksetId, WorkerLogId};
use crate::reference::Reference;
use crate::status::{SlaveStatus, WorkerLogStage};

/// One executor process's participation in one taskset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slave {
    pub id: SlaveId,
    pub taskset_id: TasksetId,
    pub name: String,
    pub status: SlaveStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
}

impl Slave {
    pub fn new(id: SlaveId, taskset_id: TasksetId, name: impl Into<String>) -> Self {
        Self {
            id,
            taskset_id,
            name: name.into(),
            status: SlaveStatus::Running,
            finished_at: None,
            log: String::new(),
        }
    }
}

/// A worker's preparation log for one taskset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLog {
    pub id: WorkerLogId,
    pub taskset_id: TasksetId,
    pub worker_name: String,
    pub started_at: DateTime<Utc>,
    pub rsync_finished_at: Option<DateTime<Utc>>,
    pub setup_finished_at: Option<DateTime<Utc>>,
    pub rspec_finished_at: Option<DateTime<Utc>>,
    pub log: String,
}

impl WorkerLog {
    pub fn new(
        id: WorkerLogId,
        taskset_id: TasksetId,
        worker_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            taskset_id,
            worker_name: worker_name.into(),
            started_at,
            rsync_finished_at: None,
            setup_finished_at: None,
            rspec_finished_at: None,
            log: String::new(),
        }
    }

    /// Record the end of a preparation stage.
    pub fn finish_stage(&mut self, stage: WorkerLogStage, at: DateTime<Utc>) {
        match stage {
            WorkerLogStage::Rsync => self.rsync_finished_at = Some(at),
            WorkerLogStage::Setup => self.setup_finished_at = Some(at),
            WorkerLogStage::Rspec => self.rspec_finished_at = Some(at),
        }
    }
}

/// Liveness snapshot of one worker, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub current_taskset: Option<Reference>,
    pub updated_at: DateTime<Utc>,
}
