//! Commands peers send to the scheduler and the payloads it answers with.

use std::fmt;

use serde::{Deserialize, Serialize};

use fleetspec_core::{
    NewTaskset, Reference, SlaveStatus, Task, Taskset, Trial, TrialReport, WorkerLogStage,
};

/// A named synchronous call.
///
/// Serialized adjacently tagged: `{"method": "cancel_taskset", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Command {
    // --- client surface ---
    /// Create a taskset in `rsync_waiting`. Replies with its reference.
    CreateTaskset(NewTaskset),
    /// Source distribution finished; move to `waiting`.
    StartTaskset { taskset: Reference },
    /// Replies with the status after the call.
    CancelTaskset { taskset: Reference },
    /// Cancel every active taskset owned by `rsync_name`. Replies with the
    /// references that were cancelled.
    CancelUserTasksets { rsync_name: String },
    /// Subscribe this connection to the taskset's push events.
    ListenToTaskset { taskset: Reference },
    QueryTasksetStatus { taskset: Reference },
    QueryTaskset { taskset: Reference },
    ListActiveTasksets {
        #[serde(default)]
        rsync_name: Option<String>,
    },
    ListWorkers,
    /// Replies with whole seconds, or null when unknown.
    QueryAverage {
        taskset_class: String,
        content_hash: String,
    },

    // --- executor surface ---
    WorkerHeartbeat {
        worker_name: String,
        #[serde(default)]
        taskset: Option<Reference>,
    },
    FailTaskset { taskset: Reference },
    /// Replies with a `TaskAssignment`, or null when no work is queued.
    DequeueTask { taskset: Reference },
    CreateSlave { taskset: Reference, name: String },
    FinishSlave { slave: Reference, status: SlaveStatus },
    CreateTrial { task: Reference, slave: Reference },
    StartTrial { trial: Reference },
    FinishTrial { trial: Reference, report: TrialReport },
    CreateWorkerLog { taskset: Reference, worker_name: String },
    FinishWorkerLogStage {
        worker_log: Reference,
        stage: WorkerLogStage,
    },
    /// Append to the log of a taskset, slave or worker log.
    AppendLog { target: Reference, text: String },
}

impl Command {
    /// Wire name, used in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateTaskset(_) => "create_taskset",
            Self::StartTaskset { .. } => "start_taskset",
            Self::CancelTaskset { .. } => "cancel_taskset",
            Self::CancelUserTasksets { .. } => "cancel_user_tasksets",
            Self::ListenToTaskset { .. } => "listen_to_taskset",
            Self::QueryTasksetStatus { .. } => "query_taskset_status",
            Self::QueryTaskset { .. } => "query_taskset",
            Self::ListActiveTasksets { .. } => "list_active_tasksets",
            Self::ListWorkers => "list_workers",
            Self::QueryAverage { .. } => "query_average",
            Self::WorkerHeartbeat { .. } => "worker_heartbeat",
            Self::FailTaskset { .. } => "fail_taskset",
            Self::DequeueTask { .. } => "dequeue_task",
            Self::CreateSlave { .. } => "create_slave",
            Self::FinishSlave { .. } => "finish_slave",
            Self::CreateTrial { .. } => "create_trial",
            Self::StartTrial { .. } => "start_trial",
            Self::FinishTrial { .. } => "finish_trial",
            Self::CreateWorkerLog { .. } => "create_worker_log",
            Self::FinishWorkerLogStage { .. } => "finish_worker_log_stage",
            Self::AppendLog { .. } => "append_log",
        }
    }
}

/// A task handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: Reference,
    pub spec_file: String,
    pub content_hash: String,
    pub soft_timeout_sec: u64,
    pub hard_timeout_sec: u64,
}

/// A task and every trial it has had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: Task,
    pub trials: Vec<Trial>,
}

/// Full state of one taskset, as `show` prints it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksetSummary {
    pub taskset: Taskset,
    pub tasks: Vec<TaskSummary>,
    pub queue_size: usize,
}

/// Stable error classes carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidReference,
    InvalidInput,
    Storage,
    Malformed,
    Timeout,
    Internal,
}

/// Error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
