//! Per-taskset task queues.
//!
//! Queue contents live in a keyed list store so the scheduler can run
//! against a shared backend. Only task ids are stored.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fleetspec_core::{TaskId, TasksetId};

use crate::store::StoreError;

/// Keyed FIFO lists of integers.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn push_back(&self, key: &str, value: u64) -> Result<(), StoreError>;
    async fn push_front(&self, key: &str, value: u64) -> Result<(), StoreError>;
    async fn pop_front(&self, key: &str) -> Result<Option<u64>, StoreError>;
    async fn len(&self, key: &str) -> Result<usize, StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process list store.
#[derive(Default)]
pub struct MemoryListStore {
    lists: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn push_back(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn push_front(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut lists = self.lists.lock().await;
        let Some(list) = lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(value)
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lists.lock().await.get(key).map_or(0, VecDeque::len))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.lists.lock().await.remove(key);
        Ok(())
    }
}

/// FIFO of task ids awaiting dispatch for one taskset.
///
/// Retries go to the front, speculative re-dispatch to the back. A task id
/// may appear more than once.
#[derive(Clone)]
pub struct TaskQueue {
    key: String,
    backend: Arc<dyn ListStore>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn ListStore>, taskset_id: TasksetId) -> Self {
        Self {
            key: format!("fleetspec:taskset:{}:queue", taskset_id),
            backend,
        }
    }

    pub async fn enqueue(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.backend.push_back(&self.key, task_id.get()).await
    }

    /// Put a task ahead of everything else.
    pub async fn front_enqueue(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.backend.push_front(&self.key, task_id.get()).await
    }

    pub async fn dequeue(&self) -> Result<Option<TaskId>, StoreError> {
        Ok(self.backend.pop_front(&self.key).await?.map(TaskId::new))
    }

    pub async fn size(&self) -> Result<usize, StoreError> {
        self.backend.len(&self.key).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.size().await? == 0)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.backend.clear(&self.key).await
    }
}
