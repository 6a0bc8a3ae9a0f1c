//! Per-spec duration estimates.
//!
//! The average of the most recent passed or pending trials of a spec, scoped
//! to a taskset class, rounded down to whole seconds. Results are cached for
//! a fixed TTL; unknown averages are never cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use fleetspec_core::TrialStatus;

use crate::store::{RecordStore, StoreError, TrialSampleQuery};

type CacheKey = (String, String);

pub struct DurationEstimator {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
    sample_limit: usize,
    cache: RwLock<HashMap<CacheKey, (u64, Instant)>>,
}

impl DurationEstimator {
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration, sample_limit: usize) -> Self {
        Self {
            store,
            ttl,
            sample_limit,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compute the average from storage, bypassing the cache.
    pub async fn calc_average(
        &self,
        taskset_class: &str,
        content_hash: &str,
    ) -> Result<Option<u64>, StoreError> {
        let samples = self
            .store
            .recent_trials(&TrialSampleQuery {
                taskset_class: taskset_class.to_string(),
                content_hash: content_hash.to_string(),
                statuses: vec![TrialStatus::Passed, TrialStatus::Pending],
                limit: self.sample_limit,
            })
            .await?;

        let durations: Vec<i64> = samples
            .iter()
            .filter_map(|t| t.duration())
            .map(|d| d.num_milliseconds())
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }

        let mean_ms = durations.iter().sum::<i64>() / durations.len() as i64;
        Ok(Some((mean_ms / 1000).max(0) as u64))
    }

    /// Recompute and cache the average. Called when a task passes or pends.
    pub async fn update_average(
        &self,
        taskset_class: &str,
        content_hash: &str,
    ) -> Result<Option<u64>, StoreError> {
        let average = self.calc_average(taskset_class, content_hash).await?;
        let key = (taskset_class.to_string(), content_hash.to_string());
        let mut cache = self.cache.write().await;
        match average {
            Some(secs) => {
                cache.insert(key, (secs, Instant::now() + self.ttl));
            }
            None => {
                cache.remove(&key);
            }
        }
        debug!(taskset_class, content_hash, ?average, "Updated duration average");
        Ok(average)
    }

    /// Cached average, computing it on a miss or after expiry.
    pub async fn average(
        &self,
        taskset_class: &str,
        content_hash: &str,
    ) -> Result<Option<u64>, StoreError> {
        let key = (taskset_class.to_string(), content_hash.to_string());
        if let Some((secs, expires_at)) = self.cache.read().await.get(&key) {
            if Instant::now() < *expires_at {
                return Ok(Some(*secs));
            }
        }
        self.update_average(taskset_class, content_hash).await
    }
}
