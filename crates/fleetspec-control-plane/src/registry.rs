//! Ephemeral worker liveness.
//!
//! Entries are rebuilt from heartbeats and swept lazily on read. Nothing
//! here survives a restart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use fleetspec_core::{Reference, WorkerInfo};

struct WorkerEntry {
    current_taskset: Option<Reference>,
    updated_at: DateTime<Utc>,
    touched: Instant,
}

impl WorkerEntry {
    fn fresh() -> Self {
        Self {
            current_taskset: None,
            updated_at: Utc::now(),
            touched: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.touched = Instant::now();
    }

    fn info(&self, name: &str) -> WorkerInfo {
        WorkerInfo {
            name: name.to_string(),
            current_taskset: self.current_taskset,
            updated_at: self.updated_at,
        }
    }
}

/// Worker name to last-seen time and current assignment.
pub struct WorkerRegistry {
    staleness: Duration,
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Existing entry for `name`, or a newly created one stamped now.
    pub async fn with_name(&self, name: &str) -> WorkerInfo {
        let mut workers = self.workers.write().await;
        workers
            .entry(name.to_string())
            .or_insert_with(WorkerEntry::fresh)
            .info(name)
    }

    /// Record a heartbeat with the worker's current assignment.
    pub async fn set_current_taskset(&self, name: &str, taskset: Option<Reference>) -> WorkerInfo {
        let mut workers = self.workers.write().await;
        let entry = workers
            .entry(name.to_string())
            .or_insert_with(WorkerEntry::fresh);
        entry.current_taskset = taskset;
        entry.touch();
        entry.info(name)
    }

    /// Live workers sorted by name, evicting stale entries first.
    pub async fn all(&self) -> Vec<WorkerInfo> {
        let mut workers = self.workers.write().await;
        let now = Instant::now();
        let staleness = self.staleness;
        workers.retain(|name, entry| {
            let live = now.duration_since(entry.touched) <= staleness;
            if !live {
                info!(worker = %name, "Evicting stale worker");
            }
            live
        });

        let mut live: Vec<WorkerInfo> = workers
            .iter()
            .map(|(name, entry)| entry.info(name))
            .collect();
        live.sort_by(|a, b| a.name.cmp(&b.name));
        live
    }

    /// Number of live workers.
    pub async fn count(&self) -> usize {
        self.all().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetspec_core::{Referable, TasksetId};

    #[tokio::test(start_paused = true)]
    async fn test_stale_worker_is_evicted_and_reappears() {
        let registry = WorkerRegistry::new(Duration::from_secs(60));
        registry.set_current_taskset("w1", None).await;
        registry
            .set_current_taskset("w2", Some(TasksetId::new(3).to_ref()))
            .await;

        tokio::time::advance(Duration::from_secs(45)).await;
        registry.set_current_taskset("w2", None).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let names: Vec<String> = registry.all().await.into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["w2".to_string()]);

        registry.set_current_taskset("w1", None).await;
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_with_name_keeps_existing_assignment() {
        let registry = WorkerRegistry::new(Duration::from_secs(60));
        let taskset = TasksetId::new(9).to_ref();
        registry.set_current_taskset("w1", Some(taskset)).await;

        let info = registry.with_name("w1").await;
        assert_eq!(info.current_taskset, Some(taskset));

        let created = registry.with_name("w2").await;
        assert_eq!(created.current_taskset, None);
        assert_eq!(registry.count().await, 2);
    }
}
