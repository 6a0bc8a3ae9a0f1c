//! Shared application state.

use std::sync::Arc;

use fleetspec_core::TasksetId;

use crate::bus::EventBus;
use crate::config::Config;
use crate::estimator::DurationEstimator;
use crate::queue::{ListStore, MemoryListStore, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::store::{MemoryStore, RecordStore};

/// Components the scheduler and the HTTP surface share.
pub struct AppState {
    pub config: Config,

    /// Durable records.
    pub store: Arc<dyn RecordStore>,

    /// Backend for the per-taskset queues.
    pub queues: Arc<dyn ListStore>,

    pub estimator: DurationEstimator,

    /// Worker liveness, owned by this state rather than process-global.
    pub workers: WorkerRegistry,

    /// Push event fan-out to connected peers.
    pub bus: EventBus,
}

impl AppState {
    /// State backed by in-memory stores.
    pub fn new(config: Config) -> Arc<Self> {
        let workers = WorkerRegistry::new(config.worker_staleness());
        Self::with_backends(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryListStore::new()),
            workers,
        )
    }

    pub fn with_backends(
        config: Config,
        store: Arc<dyn RecordStore>,
        queues: Arc<dyn ListStore>,
        workers: WorkerRegistry,
    ) -> Arc<Self> {
        let estimator = DurationEstimator::new(
            store.clone(),
            config.average_ttl(),
            config.average_sample_limit,
        );
        Arc::new(Self {
            config,
            store,
            queues,
            estimator,
            workers,
            bus: EventBus::new(),
        })
    }

    /// The queue of one taskset.
    pub fn queue(&self, taskset_id: TasksetId) -> TaskQueue {
        TaskQueue::new(self.queues.clone(), taskset_id)
    }
}
