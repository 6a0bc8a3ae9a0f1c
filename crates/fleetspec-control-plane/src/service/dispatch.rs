//! Command dispatch - one scheduler operation per inbound call.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use fleetspec_core::{CoreError, Referable, SlaveId, TaskId, TasksetId, TrialId, WorkerLogId};
use fleetspec_proto::{Command, ErrorCode, Outcome, RpcError, TaskAssignment};

use crate::bus::SubscriberId;
use crate::scheduler::{Scheduler, SchedulerError};

/// Failure while handling one call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<DispatchError> for RpcError {
    fn from(err: DispatchError) -> Self {
        let code = match &err {
            DispatchError::Core(core) | DispatchError::Scheduler(SchedulerError::Core(core)) => {
                core_code(core)
            }
            DispatchError::Scheduler(SchedulerError::NotFound(_)) => ErrorCode::InvalidReference,
            DispatchError::Scheduler(SchedulerError::InvalidInput(_)) => ErrorCode::InvalidInput,
            DispatchError::Scheduler(SchedulerError::Storage(_)) => ErrorCode::Storage,
            DispatchError::Encode(_) => ErrorCode::Internal,
        };
        RpcError::new(code, err.to_string())
    }
}

fn core_code(err: &CoreError) -> ErrorCode {
    match err {
        CoreError::InvalidReference { .. } | CoreError::UnknownKind(_) => {
            ErrorCode::InvalidReference
        }
        CoreError::InvalidStatus(_) | CoreError::InvalidInput(_) => ErrorCode::InvalidInput,
    }
}

fn reply<T: Serialize>(value: T) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(value)?)
}

/// Handle one call. Every call yields exactly one outcome.
pub async fn handle_call(
    scheduler: &Scheduler,
    subscriber: SubscriberId,
    command: Command,
) -> Outcome {
    let method = command.method();
    match execute(scheduler, subscriber, command).await {
        Ok(value) => Outcome::Ok(value),
        Err(err) => {
            warn!(method, error = %err, "Call failed");
            Outcome::Err(err.into())
        }
    }
}

async fn execute(
    scheduler: &Scheduler,
    subscriber: SubscriberId,
    command: Command,
) -> Result<Value, DispatchError> {
    match command {
        // --- client surface ---
        Command::CreateTaskset(spec) => {
            let taskset = scheduler.create_taskset(spec).await?;
            reply(taskset.id.to_ref())
        }
        Command::StartTaskset { taskset } => {
            reply(scheduler.start_taskset(taskset.decode::<TasksetId>()?).await?)
        }
        Command::CancelTaskset { taskset } => {
            reply(scheduler.cancel_taskset(taskset.decode::<TasksetId>()?).await?)
        }
        Command::CancelUserTasksets { rsync_name } => {
            let cancelled = scheduler.cancel_user_tasksets(&rsync_name).await?;
            reply(cancelled.into_iter().map(TasksetId::to_ref).collect::<Vec<_>>())
        }
        Command::ListenToTaskset { taskset } => {
            let id = taskset.decode::<TasksetId>()?;
            let taskset = scheduler.ensure_taskset(id).await?;
            scheduler.state().bus.listen(subscriber, id).await;
            reply(taskset.status)
        }
        Command::QueryTasksetStatus { taskset } => {
            reply(scheduler.query_taskset_status(taskset.decode::<TasksetId>()?).await?)
        }
        Command::QueryTaskset { taskset } => {
            reply(scheduler.query_taskset(taskset.decode::<TasksetId>()?).await?)
        }
        Command::ListActiveTasksets { rsync_name } => {
            reply(scheduler.list_active_tasksets(rsync_name).await?)
        }
        Command::ListWorkers => reply(scheduler.list_workers().await),
        Command::QueryAverage {
            taskset_class,
            content_hash,
        } => reply(scheduler.query_average(&taskset_class, &content_hash).await?),

        // --- executor surface ---
        Command::WorkerHeartbeat {
            worker_name,
            taskset,
        } => {
            let taskset = taskset.map(|r| r.decode::<TasksetId>()).transpose()?;
            reply(scheduler.worker_heartbeat(&worker_name, taskset).await?)
        }
        Command::FailTaskset { taskset } => {
            reply(scheduler.fail_taskset(taskset.decode::<TasksetId>()?).await?)
        }
        Command::DequeueTask { taskset } => {
            let assignment = scheduler
                .dequeue_task(taskset.decode::<TasksetId>()?)
                .await?
                .map(|task| TaskAssignment {
                    task: task.id.to_ref(),
                    spec_file: task.spec_file,
                    content_hash: task.content_hash,
                    soft_timeout_sec: task.soft_timeout_sec,
                    hard_timeout_sec: task.hard_timeout_sec,
                });
            reply(assignment)
        }
        Command::CreateSlave { taskset, name } => {
            let slave = scheduler
                .create_slave(taskset.decode::<TasksetId>()?, &name)
                .await?;
            reply(slave.id.to_ref())
        }
        Command::FinishSlave { slave, status } => {
            let slave = scheduler
                .finish_slave(slave.decode::<SlaveId>()?, status)
                .await?;
            reply(slave.status)
        }
        Command::CreateTrial { task, slave } => {
            let trial = scheduler
                .create_trial(task.decode::<TaskId>()?, slave.decode::<SlaveId>()?)
                .await?;
            reply(trial.id.to_ref())
        }
        Command::StartTrial { trial } => {
            let trial = scheduler.start_trial(trial.decode::<TrialId>()?).await?;
            reply(trial.started_at)
        }
        Command::FinishTrial { trial, report } => {
            let trial = scheduler
                .finish_trial(trial.decode::<TrialId>()?, report)
                .await?;
            reply(trial.status)
        }
        Command::CreateWorkerLog {
            taskset,
            worker_name,
        } => {
            let worker_log = scheduler
                .create_worker_log(taskset.decode::<TasksetId>()?, &worker_name)
                .await?;
            reply(worker_log.id.to_ref())
        }
        Command::FinishWorkerLogStage { worker_log, stage } => {
            scheduler
                .finish_worker_log_stage(worker_log.decode::<WorkerLogId>()?, stage)
                .await?;
            Ok(Value::Null)
        }
        Command::AppendLog { target, text } => {
            scheduler.append_log(target, &text).await?;
            Ok(Value::Null)
        }
    }
}
