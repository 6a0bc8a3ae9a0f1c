//! HTTP response types.

use serde::Serialize;

use fleetspec_core::{Taskset, WorkerInfo};

/// One live worker.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub name: String,
    /// `taskset:<id>`, if the worker reported one.
    pub current_taskset: Option<String>,
    pub updated_at: String,
}

impl From<WorkerInfo> for WorkerResponse {
    fn from(info: WorkerInfo) -> Self {
        Self {
            name: info.name,
            current_taskset: info.current_taskset.map(|r| r.to_string()),
            updated_at: info.updated_at.to_rfc3339(),
        }
    }
}

/// One taskset, without its log.
#[derive(Debug, Serialize)]
pub struct TasksetResponse {
    pub id: u64,
    pub status: String,
    pub rsync_name: String,
    pub taskset_class: String,
    pub worker_type: String,
    pub max_workers: u32,
    pub max_trials: u32,
    pub created_at: String,
}

impl From<Taskset> for TasksetResponse {
    fn from(taskset: Taskset) -> Self {
        Self {
            id: taskset.id.get(),
            status: taskset.status.to_string(),
            rsync_name: taskset.rsync_name,
            taskset_class: taskset.taskset_class,
            worker_type: taskset.worker_type,
            max_workers: taskset.max_workers,
            max_trials: taskset.max_trials,
            created_at: taskset.created_at.to_rfc3339(),
        }
    }
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
