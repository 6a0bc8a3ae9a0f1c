//! Durable record store boundary.
//!
//! The scheduler needs create/read/update by id, a few filtered queries and
//! append-only large-text fields. `MemoryStore` is the in-process backend used
//! by the server binary and the tests; a relational backend implements the
//! same trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use fleetspec_core::{
    NewTask, NewTaskset, Reference, Slave, SlaveId, Task, TaskId, TaskTimeouts, Taskset,
    TasksetId, Trial, TrialId, TrialStatus, WorkerLog, WorkerLogId,
};

/// Generic storage failure. The scheduler does not interpret it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Filter for taskset listings.
#[derive(Debug, Clone, Default)]
pub struct TasksetFilter {
    /// Only tasksets owned by this rsync name.
    pub rsync_name: Option<String>,
    /// Only tasksets in a non-terminal status.
    pub active_only: bool,
}

/// "Most recent N trials of this spec in this taskset class."
#[derive(Debug, Clone)]
pub struct TrialSampleQuery {
    pub taskset_class: String,
    pub content_hash: String,
    pub statuses: Vec<TrialStatus>,
    pub limit: usize,
}

/// Persistence boundary for tasksets, tasks, trials, slaves and worker logs.
///
/// `update_*` writes every field except the append-only logs, which only
/// change through [`RecordStore::append_log`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_taskset(
        &self,
        spec: &NewTaskset,
        created_at: DateTime<Utc>,
    ) -> Result<Taskset, StoreError>;
    async fn taskset(&self, id: TasksetId) -> Result<Option<Taskset>, StoreError>;
    async fn update_taskset(&self, taskset: &Taskset) -> Result<(), StoreError>;
    async fn tasksets(&self, filter: &TasksetFilter) -> Result<Vec<Taskset>, StoreError>;

    async fn create_task(
        &self,
        taskset_id: TasksetId,
        spec: &NewTask,
        timeouts: TaskTimeouts,
    ) -> Result<Task, StoreError>;
    async fn task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn tasks_for_taskset(&self, taskset_id: TasksetId) -> Result<Vec<Task>, StoreError>;

    async fn create_trial(
        &self,
        task_id: TaskId,
        slave_id: SlaveId,
        created_at: DateTime<Utc>,
    ) -> Result<Trial, StoreError>;
    async fn trial(&self, id: TrialId) -> Result<Option<Trial>, StoreError>;
    async fn update_trial(&self, trial: &Trial) -> Result<(), StoreError>;
    async fn trials_for_task(&self, task_id: TaskId) -> Result<Vec<Trial>, StoreError>;
    /// Newest first by creation time.
    async fn recent_trials(&self, query: &TrialSampleQuery) -> Result<Vec<Trial>, StoreError>;

    async fn create_slave(&self, taskset_id: TasksetId, name: &str) -> Result<Slave, StoreError>;
    async fn slave(&self, id: SlaveId) -> Result<Option<Slave>, StoreError>;
    async fn update_slave(&self, slave: &Slave) -> Result<(), StoreError>;

    async fn create_worker_log(
        &self,
        taskset_id: TasksetId,
        worker_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<WorkerLog, StoreError>;
    async fn worker_log(&self, id: WorkerLogId) -> Result<Option<WorkerLog>, StoreError>;
    async fn update_worker_log(&self, worker_log: &WorkerLog) -> Result<(), StoreError>;

    /// Append to the log of a taskset, slave or worker log. Returns false if
    /// the target does not exist or has no log.
    async fn append_log(&self, target: Reference, text: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    tasksets: BTreeMap<TasksetId, Taskset>,
    tasks: BTreeMap<TaskId, Task>,
    trials: BTreeMap<TrialId, Trial>,
    slaves: BTreeMap<SlaveId, Slave>,
    worker_logs: BTreeMap<WorkerLogId, WorkerLog>,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory record store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_taskset(
        &self,
        spec: &NewTaskset,
        created_at: DateTime<Utc>,
    ) -> Result<Taskset, StoreError> {
        let mut tables = self.tables.write().await;
        let id = TasksetId::new(tables.allocate());
        let taskset = Taskset::new(id, spec, created_at);
        tables.tasksets.insert(id, taskset.clone());
        Ok(taskset)
    }

    async fn taskset(&self, id: TasksetId) -> Result<Option<Taskset>, StoreError> {
        Ok(self.tables.read().await.tasksets.get(&id).cloned())
    }

    async fn update_taskset(&self, taskset: &Taskset) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .tasksets
            .get_mut(&taskset.id)
            .ok_or_else(|| StoreError::Backend(format!("taskset {} vanished", taskset.id)))?;
        let log = std::mem::take(&mut stored.log);
        *stored = Taskset {
            log,
            ..taskset.clone()
        };
        Ok(())
    }

    async fn tasksets(&self, filter: &TasksetFilter) -> Result<Vec<Taskset>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasksets
            .values()
            .filter(|t| !filter.active_only || t.status.is_active())
            .filter(|t| {
                filter
                    .rsync_name
                    .as_deref()
                    .map_or(true, |name| t.rsync_name == name)
            })
            .cloned()
            .collect())
    }

    async fn create_task(
        &self,
        taskset_id: TasksetId,
        spec: &NewTask,
        timeouts: TaskTimeouts,
    ) -> Result<Task, StoreError> {
        let mut tables = self.tables.write().await;
        let id = TaskId::new(tables.allocate());
        let task = Task {
            id,
            taskset_id,
            status: Default::default(),
            spec_file: spec.spec_file.clone(),
            content_hash: spec.content_hash.clone(),
            hard_timeout_sec: timeouts.hard_timeout_sec,
            soft_timeout_sec: timeouts.soft_timeout_sec,
        };
        tables.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("task {} vanished", task.id))),
        }
    }

    async fn tasks_for_taskset(&self, taskset_id: TasksetId) -> Result<Vec<Task>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.taskset_id == taskset_id)
            .cloned()
            .collect())
    }

    async fn create_trial(
        &self,
        task_id: TaskId,
        slave_id: SlaveId,
        created_at: DateTime<Utc>,
    ) -> Result<Trial, StoreError> {
        let mut tables = self.tables.write().await;
        let id = TrialId::new(tables.allocate());
        let trial = Trial::new(id, task_id, slave_id, created_at);
        tables.trials.insert(id, trial.clone());
        Ok(trial)
    }

    async fn trial(&self, id: TrialId) -> Result<Option<Trial>, StoreError> {
        Ok(self.tables.read().await.trials.get(&id).cloned())
    }

    async fn update_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.trials.get_mut(&trial.id) {
            Some(stored) => {
                *stored = trial.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("trial {} vanished", trial.id))),
        }
    }

    async fn trials_for_task(&self, task_id: TaskId) -> Result<Vec<Trial>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .trials
            .values()
            .filter(|t| t.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn recent_trials(&self, query: &TrialSampleQuery) -> Result<Vec<Trial>, StoreError> {
        let tables = self.tables.read().await;
        let mut samples: Vec<&Trial> = tables
            .trials
            .values()
            .filter(|trial| query.statuses.contains(&trial.status))
            .filter(|trial| {
                let Some(task) = tables.tasks.get(&trial.task_id) else {
                    return false;
                };
                task.content_hash == query.content_hash
                    && tables
                        .tasksets
                        .get(&task.taskset_id)
                        .is_some_and(|ts| ts.taskset_class == query.taskset_class)
            })
            .collect();

        samples.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(samples.into_iter().take(query.limit).cloned().collect())
    }

    async fn create_slave(&self, taskset_id: TasksetId, name: &str) -> Result<Slave, StoreError> {
        let mut tables = self.tables.write().await;
        let id = SlaveId::new(tables.allocate());
        let slave = Slave::new(id, taskset_id, name);
        tables.slaves.insert(id, slave.clone());
        Ok(slave)
    }

    async fn slave(&self, id: SlaveId) -> Result<Option<Slave>, StoreError> {
        Ok(self.tables.read().await.slaves.get(&id).cloned())
    }

    async fn update_slave(&self, slave: &Slave) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .slaves
            .get_mut(&slave.id)
            .ok_or_else(|| StoreError::Backend(format!("slave {} vanished", slave.id)))?;
        let log = std::mem::take(&mut stored.log);
        *stored = Slave {
            log,
            ..slave.clone()
        };
        Ok(())
    }

    async fn create_worker_log(
        &self,
        taskset_id: TasksetId,
        worker_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<WorkerLog, StoreError> {
        let mut tables = self.tables.write().await;
        let id = WorkerLogId::new(tables.allocate());
        let worker_log = WorkerLog::new(id, taskset_id, worker_name, started_at);
        tables.worker_logs.insert(id, worker_log.clone());
        Ok(worker_log)
    }

    async fn worker_log(&self, id: WorkerLogId) -> Result<Option<WorkerLog>, StoreError> {
        Ok(self.tables.read().await.worker_logs.get(&id).cloned())
    }

    async fn update_worker_log(&self, worker_log: &WorkerLog) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables.worker_logs.get_mut(&worker_log.id).ok_or_else(|| {
            StoreError::Backend(format!("worker log {} vanished", worker_log.id))
        })?;
        let log = std::mem::take(&mut stored.log);
        *stored = WorkerLog {
            log,
            ..worker_log.clone()
        };
        Ok(())
    }

    async fn append_log(&self, target: Reference, text: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let log = match target {
            Reference::Taskset(id) => tables.tasksets.get_mut(&id).map(|t| &mut t.log),
            Reference::Slave(id) => tables.slaves.get_mut(&id).map(|s| &mut s.log),
            Reference::WorkerLog(id) => tables.worker_logs.get_mut(&id).map(|w| &mut w.log),
            Reference::Task(_) | Reference::Trial(_) => None,
        };
        match log {
            Some(log) => {
                log.push_str(text);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
