//! Taskset scheduler - queue management, task verdicts and speculative retry.
//!
//! Every inbound call may run concurrently with any other. Task transitions
//! are serialized by a per-task lock and taskset transitions by a per-taskset
//! lock; when both are needed the taskset lock is taken first.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use fleetspec_core::{
    evaluate_trials, CoreError, NewTaskset, PushEvent, Referable, Reference, Slave, SlaveChanges,
    SlaveId, SlaveStatus, Task, TaskChanges, TaskId, TaskStatus, TaskVerdict, Taskset,
    TasksetChanges, TasksetId, TasksetStatus, Trial, TrialId, TrialReport, WorkerInfo, WorkerLog,
    WorkerLogChanges, WorkerLogId, WorkerLogStage,
};
use fleetspec_proto::{TaskSummary, TasksetSummary};

use crate::state::AppState;
use crate::store::{StoreError, TasksetFilter};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Not found: {0}")]
    NotFound(Reference),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Whether a failed-but-retryable task goes back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryMode {
    /// Priority retry at the head of the queue.
    Requeue,
    /// Revalidation only.
    Hold,
}

/// Task state after a completion check.
#[derive(Debug, Clone, Copy)]
struct Settled {
    status: TaskStatus,
    attempts: usize,
    changed: bool,
}

/// What became of a trial report.
#[derive(Debug)]
enum Recorded {
    /// The trial or its taskset had already finished.
    Ignored(Trial),
    Settled { trial: Trial, task_finished: bool },
}

/// Lazily created async locks keyed by entity id.
struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Copy + Eq + Hash> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the entries of `keys` that nobody holds or waits on.
    ///
    /// Holders and waiters clone the entry under the map lock, so a count of
    /// one seen under that lock means the entry is idle.
    fn prune(&self, keys: impl IntoIterator<Item = K>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }
}

/// Pick a speculative duplicate among the least-attempted unfinished tasks.
///
/// `candidates` pairs each unfinished task with its trial count.
pub fn pick_speculative<R: Rng + ?Sized>(
    candidates: &[(TaskId, usize)],
    rng: &mut R,
) -> Option<TaskId> {
    let fewest = candidates.iter().map(|(_, attempts)| *attempts).min()?;
    let group: Vec<TaskId> = candidates
        .iter()
        .filter(|(_, attempts)| *attempts == fewest)
        .map(|(id, _)| *id)
        .collect();
    group.choose(rng).copied()
}

/// Taskset scheduler.
pub struct Scheduler {
    state: Arc<AppState>,
    task_locks: KeyedLocks<TaskId>,
    taskset_locks: KeyedLocks<TasksetId>,
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            task_locks: KeyedLocks::new(),
            taskset_locks: KeyedLocks::new(),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    async fn publish(&self, taskset_id: TasksetId, event: PushEvent) {
        self.state.bus.publish(taskset_id, event).await;
    }

    async fn load_taskset(&self, id: TasksetId) -> Result<Taskset, SchedulerError> {
        self.state
            .store
            .taskset(id)
            .await?
            .ok_or(SchedulerError::NotFound(id.to_ref()))
    }

    async fn load_task(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.state
            .store
            .task(id)
            .await?
            .ok_or(SchedulerError::NotFound(id.to_ref()))
    }

    async fn load_trial(&self, id: TrialId) -> Result<Trial, SchedulerError> {
        self.state
            .store
            .trial(id)
            .await?
            .ok_or(SchedulerError::NotFound(id.to_ref()))
    }

    async fn load_slave(&self, id: SlaveId) -> Result<Slave, SchedulerError> {
        self.state
            .store
            .slave(id)
            .await?
            .ok_or(SchedulerError::NotFound(id.to_ref()))
    }

    async fn load_worker_log(&self, id: WorkerLogId) -> Result<WorkerLog, SchedulerError> {
        self.state
            .store
            .worker_log(id)
            .await?
            .ok_or(SchedulerError::NotFound(id.to_ref()))
    }

    /// Resolve a taskset, failing if it does not exist.
    pub async fn ensure_taskset(&self, id: TasksetId) -> Result<Taskset, SchedulerError> {
        self.load_taskset(id).await
    }

    // ------------------------------------------------------------------
    // Taskset lifecycle
    // ------------------------------------------------------------------

    /// Create a taskset in `rsync_waiting` and queue all of its tasks.
    pub async fn create_taskset(&self, spec: NewTaskset) -> Result<Taskset, SchedulerError> {
        spec.validate()?;

        let store = &self.state.store;
        let taskset = store.create_taskset(&spec, Utc::now()).await?;
        let queue = self.state.queue(taskset.id);

        for new_task in &spec.tasks {
            let average = self
                .state
                .estimator
                .average(&spec.taskset_class, &new_task.content_hash)
                .await?;
            let timeouts = spec.timeout_policy.timeouts(average);
            let task = store.create_task(taskset.id, new_task, timeouts).await?;
            queue.enqueue(task.id).await?;
        }

        info!(
            taskset_id = %taskset.id,
            rsync_name = %taskset.rsync_name,
            taskset_class = %taskset.taskset_class,
            tasks = spec.tasks.len(),
            "Taskset created"
        );

        Ok(taskset)
    }

    /// Source distribution finished: `rsync_waiting` to `waiting`.
    pub async fn start_taskset(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        self.advance_status(id, TasksetStatus::RsyncWaiting, TasksetStatus::Waiting)
            .await
    }

    /// Move a taskset from `from` to `to`, if it is still in `from`.
    async fn advance_status(
        &self,
        id: TasksetId,
        from: TasksetStatus,
        to: TasksetStatus,
    ) -> Result<TasksetStatus, SchedulerError> {
        let _guard = self.taskset_locks.lock(id).await;
        let mut taskset = self.load_taskset(id).await?;
        if taskset.status != from {
            return Ok(taskset.status);
        }

        taskset.status = to;
        self.state.store.update_taskset(&taskset).await?;
        info!(taskset_id = %id, from = %from, to = %to, "Taskset status changed");

        self.publish(
            id,
            PushEvent::TasksetUpdated {
                timestamp: Utc::now(),
                taskset: id.to_ref(),
                changes: TasksetChanges {
                    status: Some(to),
                    finished_at: None,
                },
            },
        )
        .await;
        Ok(to)
    }

    /// Finish a taskset. Finishing a terminal taskset is a no-op; the
    /// returned status is the one after the call.
    pub async fn finish_taskset(
        &self,
        id: TasksetId,
        status: TasksetStatus,
    ) -> Result<TasksetStatus, SchedulerError> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidInput(format!(
                "'{}' is not a terminal taskset status",
                status
            )));
        }
        let status = {
            let _guard = self.taskset_locks.lock(id).await;
            let taskset = self.load_taskset(id).await?;
            self.finish_locked(taskset, status).await?
        };
        self.taskset_locks.prune([id]);
        Ok(status)
    }

    pub async fn cancel_taskset(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        self.finish_taskset(id, TasksetStatus::Cancelled).await
    }

    pub async fn fail_taskset(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        self.finish_taskset(id, TasksetStatus::Failed).await
    }

    /// Cancel every active taskset owned by `rsync_name`.
    pub async fn cancel_user_tasksets(
        &self,
        rsync_name: &str,
    ) -> Result<Vec<TasksetId>, SchedulerError> {
        let active = self.list_active_tasksets(Some(rsync_name.to_string())).await?;
        let mut cancelled = Vec::new();
        for taskset in active {
            if self.cancel_taskset(taskset.id).await? == TasksetStatus::Cancelled {
                cancelled.push(taskset.id);
            }
        }
        info!(rsync_name, count = cancelled.len(), "Cancelled user tasksets");
        Ok(cancelled)
    }

    /// Caller holds the taskset lock and prunes it after release.
    async fn finish_locked(
        &self,
        mut taskset: Taskset,
        status: TasksetStatus,
    ) -> Result<TasksetStatus, SchedulerError> {
        if taskset.is_finished() {
            debug!(taskset_id = %taskset.id, status = %taskset.status, "Taskset already finished");
            return Ok(taskset.status);
        }

        let finished_at = Utc::now();
        taskset.status = status;
        taskset.finished_at = Some(finished_at);
        self.state.store.update_taskset(&taskset).await?;
        self.state.queue(taskset.id).clear().await?;

        info!(taskset_id = %taskset.id, status = %status, "Taskset finished");

        self.publish(
            taskset.id,
            PushEvent::TasksetUpdated {
                timestamp: finished_at,
                taskset: taskset.id.to_ref(),
                changes: TasksetChanges {
                    status: Some(status),
                    finished_at: Some(finished_at),
                },
            },
        )
        .await;

        let tasks = self.state.store.tasks_for_taskset(taskset.id).await?;
        self.task_locks.prune(tasks.iter().map(|t| t.id));

        Ok(status)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Hand out the next unfinished task of a taskset, if any.
    ///
    /// Queue entries whose task already finished (a speculative duplicate of
    /// a task that has since passed) are dropped.
    pub async fn dequeue_task(&self, id: TasksetId) -> Result<Option<Task>, SchedulerError> {
        let taskset = self.load_taskset(id).await?;
        if taskset.is_finished() || taskset.status == TasksetStatus::RsyncWaiting {
            return Ok(None);
        }

        let queue = self.state.queue(id);
        let task = loop {
            let Some(task_id) = queue.dequeue().await? else {
                return Ok(None);
            };
            match self.state.store.task(task_id).await? {
                Some(task) if !task.is_finished() => break task,
                _ => debug!(taskset_id = %id, task_id = %task_id, "Dropping finished task from queue"),
            }
        };

        if taskset.status == TasksetStatus::Waiting {
            self.advance_status(id, TasksetStatus::Waiting, TasksetStatus::Running)
                .await?;
        }

        debug!(taskset_id = %id, task_id = %task.id, spec_file = %task.spec_file, "Task dequeued");
        Ok(Some(task))
    }

    pub async fn create_trial(
        &self,
        task_id: TaskId,
        slave_id: SlaveId,
    ) -> Result<Trial, SchedulerError> {
        let task = self.load_task(task_id).await?;
        self.load_slave(slave_id).await?;

        let trial = self
            .state
            .store
            .create_trial(task_id, slave_id, Utc::now())
            .await?;

        self.publish(
            task.taskset_id,
            PushEvent::TrialCreated {
                timestamp: trial.created_at,
                trial: trial.id.to_ref(),
                task: task_id.to_ref(),
                slave: slave_id.to_ref(),
                created_at: trial.created_at,
            },
        )
        .await;
        Ok(trial)
    }

    /// Stamp the trial's start time. Repeated calls keep the first stamp.
    pub async fn start_trial(&self, id: TrialId) -> Result<Trial, SchedulerError> {
        let trial = self.load_trial(id).await?;
        let _guard = self.task_locks.lock(trial.task_id).await;

        let mut trial = self.load_trial(id).await?;
        if trial.started_at.is_none() && !trial.status.is_finished() {
            trial.started_at = Some(Utc::now());
            self.state.store.update_trial(&trial).await?;
        }
        Ok(trial)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Record an executor's result for a trial and re-evaluate its task and
    /// taskset.
    ///
    /// Reports for an already finalized trial or a terminal taskset are
    /// acknowledged and ignored.
    pub async fn finish_trial(
        &self,
        id: TrialId,
        report: TrialReport,
    ) -> Result<Trial, SchedulerError> {
        report.validate()?;

        let task_id = self.load_trial(id).await?.task_id;
        let task = self.load_task(task_id).await?;

        let recorded = {
            // A finish of the taskset must not interleave with the retry
            // decision below.
            let _taskset_guard = self.taskset_locks.lock(task.taskset_id).await;
            let _guard = self.task_locks.lock(task_id).await;
            self.record_trial(id, &task, report).await?
        };

        match recorded {
            Recorded::Ignored(trial) => {
                self.task_locks.prune([task_id]);
                self.taskset_locks.prune([task.taskset_id]);
                Ok(trial)
            }
            Recorded::Settled {
                trial,
                task_finished,
            } => {
                if task_finished {
                    self.try_finish_taskset(task.taskset_id).await?;
                }
                Ok(trial)
            }
        }
    }

    /// Caller holds the taskset lock, then the task lock.
    async fn record_trial(
        &self,
        id: TrialId,
        task: &Task,
        report: TrialReport,
    ) -> Result<Recorded, SchedulerError> {
        let task_id = task.id;
        let mut trial = self.load_trial(id).await?;
        if trial.status.is_finished() {
            debug!(trial_id = %id, status = %trial.status, "Ignoring report for finished trial");
            return Ok(Recorded::Ignored(trial));
        }
        let taskset = self.load_taskset(task.taskset_id).await?;
        if taskset.is_finished() {
            debug!(
                trial_id = %id,
                taskset_id = %taskset.id,
                "Ignoring report for finished taskset"
            );
            return Ok(Recorded::Ignored(trial));
        }

        trial.finish(report, Utc::now());
        self.state.store.update_trial(&trial).await?;

        self.publish(
            task.taskset_id,
            PushEvent::TrialUpdated {
                timestamp: Utc::now(),
                trial: id.to_ref(),
                task: task_id.to_ref(),
                finished_at: trial.finished_at,
                status: trial.status,
                passed: trial.passed,
                pending: trial.pending,
                failed: trial.failed,
            },
        )
        .await;

        let settled = self.settle_task(task_id, &taskset, RetryMode::Requeue).await?;
        Ok(Recorded::Settled {
            trial,
            task_finished: settled.changed,
        })
    }

    /// Re-evaluate one task from its trials. Returns the task's status after
    /// the check; a retryable failure is requeued at the head of the queue
    /// unless the taskset has already finished.
    pub async fn try_finish_task(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        let task = self.load_task(id).await?;
        let (status, taskset_finished) = {
            let _taskset_guard = self.taskset_locks.lock(task.taskset_id).await;
            let taskset = self.load_taskset(task.taskset_id).await?;
            let _guard = self.task_locks.lock(id).await;
            let mode = if taskset.is_finished() {
                RetryMode::Hold
            } else {
                RetryMode::Requeue
            };
            let settled = self.settle_task(id, &taskset, mode).await?;
            (settled.status, taskset.is_finished())
        };
        if taskset_finished {
            self.task_locks.prune([id]);
            self.taskset_locks.prune([task.taskset_id]);
        }
        Ok(status)
    }

    /// Caller holds the task lock.
    async fn settle_task(
        &self,
        id: TaskId,
        taskset: &Taskset,
        mode: RetryMode,
    ) -> Result<Settled, SchedulerError> {
        let mut task = self.load_task(id).await?;
        let trials = self.state.store.trials_for_task(id).await?;
        let attempts = trials.len();

        if task.is_finished() {
            return Ok(Settled {
                status: task.status,
                attempts,
                changed: false,
            });
        }

        let verdict = evaluate_trials(trials.iter().map(|t| t.status), taskset.max_trials);

        if let Some(status) = verdict.finished_status() {
            task.status = status;
            self.state.store.update_task(&task).await?;
            info!(
                task_id = %id,
                taskset_id = %taskset.id,
                status = %status,
                attempts,
                "Task finished"
            );

            self.publish(
                taskset.id,
                PushEvent::TaskUpdated {
                    timestamp: Utc::now(),
                    task: id.to_ref(),
                    changes: TaskChanges {
                        status: Some(status),
                    },
                },
            )
            .await;

            if matches!(status, TaskStatus::Passed | TaskStatus::Pending) {
                self.state
                    .estimator
                    .update_average(&taskset.taskset_class, &task.content_hash)
                    .await?;
            }

            return Ok(Settled {
                status,
                attempts,
                changed: true,
            });
        }

        if let (TaskVerdict::Retry { failures }, RetryMode::Requeue) = (verdict, mode) {
            self.state.queue(taskset.id).front_enqueue(id).await?;
            info!(
                task_id = %id,
                taskset_id = %taskset.id,
                failures,
                max_trials = taskset.max_trials,
                "Task requeued for retry"
            );
        }

        Ok(Settled {
            status: task.status,
            attempts,
            changed: false,
        })
    }

    /// Finish the taskset once every task is done; otherwise, if the queue
    /// has drained, queue one speculative duplicate of a least-attempted
    /// straggler.
    pub async fn try_finish_taskset(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        let status = {
            let _guard = self.taskset_locks.lock(id).await;
            self.settle_taskset(id).await?
        };
        if status.is_terminal() {
            self.taskset_locks.prune([id]);
        }
        Ok(status)
    }

    /// Caller holds the taskset lock.
    async fn settle_taskset(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        let taskset = self.load_taskset(id).await?;
        if taskset.is_finished() {
            return Ok(taskset.status);
        }

        let tasks = self.state.store.tasks_for_taskset(id).await?;
        let mut any_failed = false;
        let mut stragglers = Vec::new();

        for task in tasks {
            if task.is_finished() {
                any_failed |= task.status == TaskStatus::Failed;
                continue;
            }
            let _task_guard = self.task_locks.lock(task.id).await;
            let settled = self.settle_task(task.id, &taskset, RetryMode::Hold).await?;
            match settled.status {
                TaskStatus::Failed => any_failed = true,
                TaskStatus::Unfinished => stragglers.push((task.id, settled.attempts)),
                TaskStatus::Passed | TaskStatus::Pending => {}
            }
        }

        if stragglers.is_empty() {
            let status = if any_failed {
                TasksetStatus::Failed
            } else {
                TasksetStatus::Succeeded
            };
            return self.finish_locked(taskset, status).await;
        }

        let queue = self.state.queue(id);
        if queue.is_empty().await? {
            let pick = pick_speculative(&stragglers, &mut rand::thread_rng());
            if let Some(task_id) = pick {
                queue.enqueue(task_id).await?;
                info!(
                    taskset_id = %id,
                    task_id = %task_id,
                    stragglers = stragglers.len(),
                    "Speculatively requeued task"
                );
            }
        }

        Ok(taskset.status)
    }

    // ------------------------------------------------------------------
    // Slaves and worker logs
    // ------------------------------------------------------------------

    pub async fn create_slave(&self, taskset_id: TasksetId, name: &str) -> Result<Slave, SchedulerError> {
        self.load_taskset(taskset_id).await?;
        let slave = self.state.store.create_slave(taskset_id, name).await?;
        self.publish(
            taskset_id,
            PushEvent::SlaveCreated {
                timestamp: Utc::now(),
                slave: slave.id.to_ref(),
                name: slave.name.clone(),
            },
        )
        .await;
        Ok(slave)
    }

    pub async fn finish_slave(&self, id: SlaveId, status: SlaveStatus) -> Result<Slave, SchedulerError> {
        if !status.is_finished() {
            return Err(SchedulerError::InvalidInput(
                "slave must finish with an exit status".into(),
            ));
        }

        let mut slave = self.load_slave(id).await?;
        if slave.status.is_finished() {
            return Ok(slave);
        }

        let finished_at = Utc::now();
        slave.status = status;
        slave.finished_at = Some(finished_at);
        self.state.store.update_slave(&slave).await?;

        self.publish(
            slave.taskset_id,
            PushEvent::SlaveUpdated {
                timestamp: finished_at,
                slave: id.to_ref(),
                changes: SlaveChanges {
                    status: Some(status),
                    finished_at: Some(finished_at),
                },
            },
        )
        .await;
        Ok(slave)
    }

    pub async fn create_worker_log(
        &self,
        taskset_id: TasksetId,
        worker_name: &str,
    ) -> Result<WorkerLog, SchedulerError> {
        self.load_taskset(taskset_id).await?;
        let worker_log = self
            .state
            .store
            .create_worker_log(taskset_id, worker_name, Utc::now())
            .await?;

        self.publish(
            taskset_id,
            PushEvent::WorkerLogCreated {
                timestamp: worker_log.started_at,
                worker_log: worker_log.id.to_ref(),
                worker_name: worker_log.worker_name.clone(),
            },
        )
        .await;
        Ok(worker_log)
    }

    pub async fn finish_worker_log_stage(
        &self,
        id: WorkerLogId,
        stage: WorkerLogStage,
    ) -> Result<WorkerLog, SchedulerError> {
        let mut worker_log = self.load_worker_log(id).await?;
        let at = Utc::now();
        worker_log.finish_stage(stage, at);
        self.state.store.update_worker_log(&worker_log).await?;

        let changes = match stage {
            WorkerLogStage::Rsync => WorkerLogChanges {
                rsync_finished_at: Some(at),
                ..Default::default()
            },
            WorkerLogStage::Setup => WorkerLogChanges {
                setup_finished_at: Some(at),
                ..Default::default()
            },
            WorkerLogStage::Rspec => WorkerLogChanges {
                rspec_finished_at: Some(at),
                ..Default::default()
            },
        };

        self.publish(
            worker_log.taskset_id,
            PushEvent::WorkerLogUpdated {
                timestamp: at,
                worker_log: id.to_ref(),
                changes,
            },
        )
        .await;
        Ok(worker_log)
    }

    /// Append text to a taskset, slave or worker log.
    pub async fn append_log(&self, target: Reference, text: &str) -> Result<(), SchedulerError> {
        if matches!(target, Reference::Task(_) | Reference::Trial(_)) {
            return Err(SchedulerError::InvalidInput(format!(
                "{} has no appendable log",
                target.kind().as_str()
            )));
        }
        if !self.state.store.append_log(target, text).await? {
            return Err(SchedulerError::NotFound(target));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn worker_heartbeat(
        &self,
        worker_name: &str,
        taskset: Option<TasksetId>,
    ) -> Result<WorkerInfo, SchedulerError> {
        if worker_name.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "worker_name must not be empty".into(),
            ));
        }
        Ok(self
            .state
            .workers
            .set_current_taskset(worker_name, taskset.map(TasksetId::to_ref))
            .await)
    }

    pub async fn list_workers(&self) -> Vec<WorkerInfo> {
        self.state.workers.all().await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query_taskset_status(&self, id: TasksetId) -> Result<TasksetStatus, SchedulerError> {
        Ok(self.load_taskset(id).await?.status)
    }

    /// Taskset with every task and its trials.
    pub async fn query_taskset(&self, id: TasksetId) -> Result<TasksetSummary, SchedulerError> {
        let taskset = self.load_taskset(id).await?;
        let store = &self.state.store;

        let mut tasks = Vec::new();
        for task in store.tasks_for_taskset(id).await? {
            let trials = store.trials_for_task(task.id).await?;
            tasks.push(TaskSummary { task, trials });
        }
        let queue_size = self.state.queue(id).size().await?;

        Ok(TasksetSummary {
            taskset,
            tasks,
            queue_size,
        })
    }

    pub async fn list_active_tasksets(
        &self,
        rsync_name: Option<String>,
    ) -> Result<Vec<Taskset>, SchedulerError> {
        Ok(self
            .state
            .store
            .tasksets(&TasksetFilter {
                rsync_name,
                active_only: true,
            })
            .await?)
    }

    pub async fn query_average(
        &self,
        taskset_class: &str,
        content_hash: &str,
    ) -> Result<Option<u64>, SchedulerError> {
        let average = self.state.estimator.average(taskset_class, content_hash).await;
        if let Err(e) = &average {
            warn!(taskset_class, content_hash, error = %e, "Average lookup failed");
        }
        Ok(average?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use fleetspec_core::{NewTask, TaskTimeouts, TimeoutPolicy, TrialStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::Notify;

    use crate::config::Config;
    use crate::queue::MemoryListStore;
    use crate::registry::WorkerRegistry;
    use crate::store::{MemoryStore, RecordStore, TrialSampleQuery};

    fn scheduler() -> Scheduler {
        Scheduler::new(AppState::new(Config::default()))
    }

    fn new_taskset(specs: &[&str], max_trials: u32) -> NewTaskset {
        NewTaskset {
            rsync_name: "alice".into(),
            setup_command: "bundle install".into(),
            slave_command: "bundle exec rspec".into(),
            worker_type: "default".into(),
            max_workers: 2,
            max_trials,
            taskset_class: "app".into(),
            timeout_policy: TimeoutPolicy::default(),
            tasks: specs
                .iter()
                .map(|s| NewTask::new(*s, format!("hash-{}", s)))
                .collect(),
        }
    }

    async fn started(s: &Scheduler, specs: &[&str], max_trials: u32) -> Taskset {
        let taskset = s.create_taskset(new_taskset(specs, max_trials)).await.unwrap();
        s.start_taskset(taskset.id).await.unwrap();
        taskset
    }

    /// Run one trial of `task` to completion with `status`.
    async fn run_trial(s: &Scheduler, task: &Task, status: TrialStatus) -> Trial {
        let trial = open_trial(s, task).await;
        s.finish_trial(trial.id, TrialReport::new(status)).await.unwrap()
    }

    async fn open_trial(s: &Scheduler, task: &Task) -> Trial {
        let slave = s.create_slave(task.taskset_id, "slave-1").await.unwrap();
        let trial = s.create_trial(task.id, slave.id).await.unwrap();
        s.start_trial(trial.id).await.unwrap()
    }

    #[test]
    fn test_pick_speculative_uses_least_attempted() {
        let candidates = [
            (TaskId::new(1), 3),
            (TaskId::new(2), 1),
            (TaskId::new(3), 1),
            (TaskId::new(4), 2),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let pick = pick_speculative(&candidates, &mut rng).unwrap();
            assert!(pick == TaskId::new(2) || pick == TaskId::new(3));
        }
        assert_eq!(pick_speculative(&[], &mut rng), None);
    }

    #[tokio::test]
    async fn test_create_taskset_sizes_unknown_timeouts() {
        let s = scheduler();
        let taskset = s
            .create_taskset(new_taskset(&["a_spec.rb", "b_spec.rb"], 1))
            .await
            .unwrap();
        assert_eq!(taskset.status, TasksetStatus::RsyncWaiting);

        let summary = s.query_taskset(taskset.id).await.unwrap();
        assert_eq!(summary.tasks.len(), 2);
        assert_eq!(summary.queue_size, 2);
        for t in &summary.tasks {
            assert_eq!(t.task.soft_timeout_sec, 720);
            assert_eq!(t.task.hard_timeout_sec, 780);
        }
    }

    #[tokio::test]
    async fn test_create_taskset_rejects_invalid_input() {
        let s = scheduler();
        let err = s.create_taskset(new_taskset(&["a_spec.rb"], 0)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Core(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_no_dispatch_before_rsync_finishes() {
        let s = scheduler();
        let taskset = s.create_taskset(new_taskset(&["a_spec.rb"], 1)).await.unwrap();
        assert!(s.dequeue_task(taskset.id).await.unwrap().is_none());

        assert_eq!(s.start_taskset(taskset.id).await.unwrap(), TasksetStatus::Waiting);
        let task = s.dequeue_task(taskset.id).await.unwrap();
        assert!(task.is_some());
        assert_eq!(
            s.query_taskset_status(taskset.id).await.unwrap(),
            TasksetStatus::Running
        );
    }

    #[tokio::test]
    async fn test_single_pass_succeeds_taskset() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();

        run_trial(&s, &task, TrialStatus::Passed).await;

        let summary = s.query_taskset(taskset.id).await.unwrap();
        assert_eq!(summary.tasks[0].task.status, TaskStatus::Passed);
        assert_eq!(summary.taskset.status, TasksetStatus::Succeeded);
        assert!(summary.taskset.finished_at.is_some());
        assert_eq!(summary.queue_size, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_fails_taskset() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 2).await;

        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &task, TrialStatus::Failed).await;
        let stored = s.state().store.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Unfinished);

        let retried = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        assert_eq!(retried.id, task.id);
        run_trial(&s, &retried, TrialStatus::Timeout).await;

        let summary = s.query_taskset(taskset.id).await.unwrap();
        assert_eq!(summary.tasks[0].task.status, TaskStatus::Failed);
        assert_eq!(summary.taskset.status, TasksetStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_goes_to_head_of_queue() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb", "c_spec.rb"], 3).await;

        let first = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &first, TrialStatus::Error).await;

        let next = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
        assert_eq!(next.spec_file, "a_spec.rb");
    }

    #[tokio::test]
    async fn test_drained_queue_triggers_one_speculative_duplicate() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb"], 1).await;

        let a = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let b = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let _slow = open_trial(&s, &b).await;

        run_trial(&s, &a, TrialStatus::Passed).await;

        let queue = s.state().queue(taskset.id);
        assert_eq!(queue.size().await.unwrap(), 1);
        let duplicate = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        assert_eq!(duplicate.id, b.id);
    }

    #[tokio::test]
    async fn test_dequeue_drops_finished_duplicates() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb"], 1).await;

        let a = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &a, TrialStatus::Passed).await;
        assert_eq!(s.try_finish_task(a.id).await.unwrap(), TaskStatus::Passed);

        // A stale duplicate of the passed task sits ahead of b.
        s.state().queue(taskset.id).front_enqueue(a.id).await.unwrap();

        let next = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        assert_eq!(next.spec_file, "b_spec.rb");
        assert!(s.dequeue_task(taskset.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_is_sticky() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;

        assert_eq!(s.cancel_taskset(taskset.id).await.unwrap(), TasksetStatus::Cancelled);
        assert_eq!(s.fail_taskset(taskset.id).await.unwrap(), TasksetStatus::Cancelled);
        assert_eq!(
            s.finish_taskset(taskset.id, TasksetStatus::Succeeded).await.unwrap(),
            TasksetStatus::Cancelled
        );
        assert!(s
            .finish_taskset(taskset.id, TasksetStatus::Running)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_clears_queue_and_pushes_finish() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb"], 1).await;
        s.dequeue_task(taskset.id).await.unwrap();

        let bus = &s.state().bus;
        let (subscriber, mut rx) = bus.register().await;
        bus.listen(subscriber, taskset.id).await;

        s.cancel_taskset(taskset.id).await.unwrap();

        assert_eq!(s.state().queue(taskset.id).size().await.unwrap(), 0);
        match rx.recv().await.unwrap() {
            PushEvent::TasksetUpdated { taskset: r, changes, .. } => {
                assert_eq!(r, taskset.id.to_ref());
                assert_eq!(changes.status, Some(TasksetStatus::Cancelled));
                assert!(changes.is_terminal_finish());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_report_after_cancel_is_ignored() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let trial = open_trial(&s, &task).await;

        s.cancel_taskset(taskset.id).await.unwrap();
        let trial = s
            .finish_trial(trial.id, TrialReport::new(TrialStatus::Passed))
            .await
            .unwrap();

        assert_eq!(trial.status, TrialStatus::Unfinished);
        let task = s.state().store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unfinished);
        assert_eq!(
            s.query_taskset_status(taskset.id).await.unwrap(),
            TasksetStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_second_report_for_trial_is_ignored() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb"], 3).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let trial = run_trial(&s, &task, TrialStatus::Failed).await;

        let again = s
            .finish_trial(trial.id, TrialReport::new(TrialStatus::Passed))
            .await
            .unwrap();
        assert_eq!(again.status, TrialStatus::Failed);
        // Only the one priority retry is queued ahead of b.
        assert_eq!(s.state().queue(taskset.id).size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unfinished_report_is_rejected() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let trial = open_trial(&s, &task).await;

        let err = s
            .finish_trial(trial.id, TrialReport::new(TrialStatus::Unfinished))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Core(_)));
    }

    #[tokio::test]
    async fn test_cancel_user_tasksets_only_touches_active() {
        let s = scheduler();
        let first = started(&s, &["a_spec.rb"], 1).await;
        let second = started(&s, &["b_spec.rb"], 1).await;
        s.fail_taskset(first.id).await.unwrap();

        let mut other = new_taskset(&["c_spec.rb"], 1);
        other.rsync_name = "bob".into();
        let bobs = s.create_taskset(other).await.unwrap();

        let cancelled = s.cancel_user_tasksets("alice").await.unwrap();
        assert_eq!(cancelled, vec![second.id]);
        assert_eq!(
            s.query_taskset_status(bobs.id).await.unwrap(),
            TasksetStatus::RsyncWaiting
        );
        assert_eq!(s.list_active_tasksets(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_passed_task_refreshes_average() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &task, TrialStatus::Passed).await;

        let average = s.query_average("app", &task.content_hash).await.unwrap();
        assert_eq!(average, Some(0));
        assert_eq!(s.query_average("app", "unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logs_append_only_to_log_owners() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;
        let worker_log = s.create_worker_log(taskset.id, "w1").await.unwrap();

        s.append_log(taskset.id.to_ref(), "hello ").await.unwrap();
        s.append_log(taskset.id.to_ref(), "world").await.unwrap();
        s.append_log(worker_log.id.to_ref(), "rsync ok").await.unwrap();

        let stored = s.ensure_taskset(taskset.id).await.unwrap();
        assert_eq!(stored.log, "hello world");

        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        assert!(matches!(
            s.append_log(task.id.to_ref(), "x").await,
            Err(SchedulerError::InvalidInput(_))
        ));
        assert!(matches!(
            s.append_log(TasksetId::new(999).to_ref(), "x").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_slave_and_worker_log_lifecycle() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 1).await;

        let slave = s.create_slave(taskset.id, "slave-1").await.unwrap();
        let slave = s.finish_slave(slave.id, SlaveStatus::NormalExit).await.unwrap();
        assert_eq!(slave.status, SlaveStatus::NormalExit);
        assert!(slave.finished_at.is_some());
        assert!(s.finish_slave(slave.id, SlaveStatus::Running).await.is_err());

        let worker_log = s.create_worker_log(taskset.id, "w1").await.unwrap();
        let worker_log = s
            .finish_worker_log_stage(worker_log.id, WorkerLogStage::Setup)
            .await
            .unwrap();
        assert!(worker_log.setup_finished_at.is_some());
        assert!(worker_log.rsync_finished_at.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_registers_worker() {
        let s = scheduler();
        s.worker_heartbeat("w1", Some(TasksetId::new(4))).await.unwrap();
        let workers = s.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].current_taskset, Some(TasksetId::new(4).to_ref()));
        assert!(s.worker_heartbeat(" ", None).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_taskset_is_not_found() {
        let s = scheduler();
        assert!(matches!(
            s.query_taskset_status(TasksetId::new(42)).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    /// Memory store whose trial listing stalls once armed, standing in for a
    /// slow database round trip.
    #[derive(Default)]
    struct SlowTrialStore {
        inner: MemoryStore,
        armed: AtomicBool,
        entered: Notify,
    }

    #[async_trait]
    impl RecordStore for SlowTrialStore {
        async fn create_taskset(
            &self,
            spec: &NewTaskset,
            created_at: DateTime<Utc>,
        ) -> Result<Taskset, StoreError> {
            self.inner.create_taskset(spec, created_at).await
        }
        async fn taskset(&self, id: TasksetId) -> Result<Option<Taskset>, StoreError> {
            self.inner.taskset(id).await
        }
        async fn update_taskset(&self, taskset: &Taskset) -> Result<(), StoreError> {
            self.inner.update_taskset(taskset).await
        }
        async fn tasksets(&self, filter: &TasksetFilter) -> Result<Vec<Taskset>, StoreError> {
            self.inner.tasksets(filter).await
        }
        async fn create_task(
            &self,
            taskset_id: TasksetId,
            spec: &NewTask,
            timeouts: TaskTimeouts,
        ) -> Result<Task, StoreError> {
            self.inner.create_task(taskset_id, spec, timeouts).await
        }
        async fn task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
            self.inner.task(id).await
        }
        async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
            self.inner.update_task(task).await
        }
        async fn tasks_for_taskset(&self, taskset_id: TasksetId) -> Result<Vec<Task>, StoreError> {
            self.inner.tasks_for_taskset(taskset_id).await
        }
        async fn create_trial(
            &self,
            task_id: TaskId,
            slave_id: SlaveId,
            created_at: DateTime<Utc>,
        ) -> Result<Trial, StoreError> {
            self.inner.create_trial(task_id, slave_id, created_at).await
        }
        async fn trial(&self, id: TrialId) -> Result<Option<Trial>, StoreError> {
            self.inner.trial(id).await
        }
        async fn update_trial(&self, trial: &Trial) -> Result<(), StoreError> {
            self.inner.update_trial(trial).await
        }
        async fn trials_for_task(&self, task_id: TaskId) -> Result<Vec<Trial>, StoreError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.trials_for_task(task_id).await
        }
        async fn recent_trials(&self, query: &TrialSampleQuery) -> Result<Vec<Trial>, StoreError> {
            self.inner.recent_trials(query).await
        }
        async fn create_slave(&self, taskset_id: TasksetId, name: &str) -> Result<Slave, StoreError> {
            self.inner.create_slave(taskset_id, name).await
        }
        async fn slave(&self, id: SlaveId) -> Result<Option<Slave>, StoreError> {
            self.inner.slave(id).await
        }
        async fn update_slave(&self, slave: &Slave) -> Result<(), StoreError> {
            self.inner.update_slave(slave).await
        }
        async fn create_worker_log(
            &self,
            taskset_id: TasksetId,
            worker_name: &str,
            started_at: DateTime<Utc>,
        ) -> Result<WorkerLog, StoreError> {
            self.inner.create_worker_log(taskset_id, worker_name, started_at).await
        }
        async fn worker_log(&self, id: WorkerLogId) -> Result<Option<WorkerLog>, StoreError> {
            self.inner.worker_log(id).await
        }
        async fn update_worker_log(&self, worker_log: &WorkerLog) -> Result<(), StoreError> {
            self.inner.update_worker_log(worker_log).await
        }
        async fn append_log(&self, target: Reference, text: &str) -> Result<bool, StoreError> {
            self.inner.append_log(target, text).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_in_flight_retry_decision() {
        let config = Config::default();
        let store = Arc::new(SlowTrialStore::default());
        let workers = WorkerRegistry::new(config.worker_staleness());
        let state = AppState::with_backends(
            config,
            store.clone(),
            Arc::new(MemoryListStore::new()),
            workers,
        );
        let s = Arc::new(Scheduler::new(state));

        let taskset = started(&s, &["a_spec.rb"], 3).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let trial = open_trial(&s, &task).await;

        store.armed.store(true, Ordering::SeqCst);
        let reporter = {
            let s = s.clone();
            tokio::spawn(async move {
                s.finish_trial(trial.id, TrialReport::new(TrialStatus::Failed))
                    .await
                    .unwrap()
            })
        };
        store.entered.notified().await;

        // The report is mid-evaluation; the cancel lands after its retry.
        assert_eq!(s.cancel_taskset(taskset.id).await.unwrap(), TasksetStatus::Cancelled);
        assert_eq!(reporter.await.unwrap().status, TrialStatus::Failed);

        let summary = s.query_taskset(taskset.id).await.unwrap();
        assert_eq!(summary.taskset.status, TasksetStatus::Cancelled);
        assert_eq!(summary.queue_size, 0);
    }

    #[tokio::test]
    async fn test_try_finish_task_does_not_refill_cancelled_queue() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb"], 3).await;
        let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &task, TrialStatus::Failed).await;
        assert_eq!(s.state().queue(taskset.id).size().await.unwrap(), 1);

        s.cancel_taskset(taskset.id).await.unwrap();
        assert_eq!(s.try_finish_task(task.id).await.unwrap(), TaskStatus::Unfinished);
        assert_eq!(s.state().queue(taskset.id).size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finished_taskset_releases_its_locks() {
        let s = scheduler();
        let taskset = started(&s, &["a_spec.rb", "b_spec.rb"], 1).await;
        let a = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        let b = s.dequeue_task(taskset.id).await.unwrap().unwrap();
        run_trial(&s, &a, TrialStatus::Passed).await;
        run_trial(&s, &b, TrialStatus::Passed).await;
        assert_eq!(
            s.query_taskset_status(taskset.id).await.unwrap(),
            TasksetStatus::Succeeded
        );

        let cancelled = started(&s, &["c_spec.rb"], 1).await;
        s.cancel_taskset(cancelled.id).await.unwrap();
        // A late report for the cancelled taskset does not pin a lock either.
        let c = s.state().store.tasks_for_taskset(cancelled.id).await.unwrap().remove(0);
        let trial = s
            .create_trial(c.id, s.create_slave(cancelled.id, "slave-2").await.unwrap().id)
            .await
            .unwrap();
        s.finish_trial(trial.id, TrialReport::new(TrialStatus::Passed))
            .await
            .unwrap();

        assert!(s.taskset_locks.locks.lock().unwrap().is_empty());
        assert!(s.task_locks.locks.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_requeue_once() {
        for _ in 0..20 {
            let s = Arc::new(scheduler());
            let taskset = started(&s, &["a_spec.rb"], 3).await;
            let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
            let first = open_trial(&s, &task).await;
            let second = open_trial(&s, &task).await;

            let reports: Vec<_> = [first.id, second.id]
                .into_iter()
                .map(|trial_id| {
                    let s = s.clone();
                    tokio::spawn(async move {
                        s.finish_trial(trial_id, TrialReport::new(TrialStatus::Failed))
                            .await
                            .unwrap()
                    })
                })
                .collect();
            for report in reports {
                report.await.unwrap();
            }

            let queue = s.state().queue(taskset.id);
            assert_eq!(queue.size().await.unwrap(), 1);
            assert_eq!(queue.dequeue().await.unwrap(), Some(task.id));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_passes_transition_task_once() {
        for _ in 0..20 {
            let s = Arc::new(scheduler());
            let taskset = started(&s, &["a_spec.rb"], 1).await;
            let task = s.dequeue_task(taskset.id).await.unwrap().unwrap();
            let first = open_trial(&s, &task).await;
            let second = open_trial(&s, &task).await;

            let bus = &s.state().bus;
            let (subscriber, mut rx) = bus.register().await;
            bus.listen(subscriber, taskset.id).await;

            let reports: Vec<_> = [first.id, second.id]
                .into_iter()
                .map(|trial_id| {
                    let s = s.clone();
                    tokio::spawn(async move {
                        s.finish_trial(trial_id, TrialReport::new(TrialStatus::Passed))
                            .await
                            .unwrap()
                    })
                })
                .collect();
            for report in reports {
                report.await.unwrap();
            }

            let mut task_updates = 0;
            let mut taskset_finishes = 0;
            while let Ok(event) = rx.try_recv() {
                match event {
                    PushEvent::TaskUpdated { .. } => task_updates += 1,
                    PushEvent::TasksetUpdated { changes, .. } if changes.is_terminal_finish() => {
                        taskset_finishes += 1
                    }
                    _ => {}
                }
            }
            assert_eq!(task_updates, 1);
            assert_eq!(taskset_finishes, 1);
            assert_eq!(
                s.query_taskset_status(taskset.id).await.unwrap(),
                TasksetStatus::Succeeded
            );
        }
    }
}
