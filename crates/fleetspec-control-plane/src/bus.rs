//! Push event fan-out.
//!
//! Each connection registers once and then listens to any number of
//! tasksets. Events published for a taskset go to every subscriber that
//! listens to it; subscribers whose receiver is gone are pruned.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use fleetspec_core::{PushEvent, TasksetId};

/// Handle for one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    tx: mpsc::UnboundedSender<PushEvent>,
    tasksets: HashSet<TasksetId>,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> (SubscriberId, mpsc::UnboundedReceiver<PushEvent>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                tx,
                tasksets: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Start delivering events of `taskset` to `subscriber`. Idempotent.
    pub async fn listen(&self, subscriber: SubscriberId, taskset: TasksetId) -> bool {
        match self.subscribers.write().await.get_mut(&subscriber) {
            Some(entry) => {
                entry.tasksets.insert(taskset);
                true
            }
            None => false,
        }
    }

    pub async fn unregister(&self, subscriber: SubscriberId) {
        self.subscribers.write().await.remove(&subscriber);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `event` to every listener of `taskset`. Returns how many
    /// subscribers received it.
    pub async fn publish(&self, taskset: TasksetId, event: PushEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.tasksets.contains(&taskset) {
                    continue;
                }
                if subscriber.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }

        debug!(
            taskset_id = %taskset,
            event = event.name(),
            delivered,
            "Published push event"
        );
        delivered
    }
}
