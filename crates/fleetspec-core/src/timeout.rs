//! Per-task timeout sizing from historical durations.

use serde::{Deserialize, Serialize};

/// How soft and hard timeouts are derived from an average duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Soft timeout for a spec with no duration history.
    pub unknown_spec_timeout_sec: u64,
    /// Floor for the soft timeout of a known spec.
    pub least_timeout_sec: u64,
    /// Soft timeout is the average times this.
    pub average_multiplier: u64,
    /// Hard timeout is the soft timeout plus this.
    pub hard_timeout_margin_sec: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            unknown_spec_timeout_sec: 720,
            least_timeout_sec: 60,
            average_multiplier: 2,
            hard_timeout_margin_sec: 60,
        }
    }
}

/// Timeouts handed to the executor with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeouts {
    pub soft_timeout_sec: u64,
    pub hard_timeout_sec: u64,
}

impl TimeoutPolicy {
    pub fn timeouts(&self, average_sec: Option<u64>) -> TaskTimeouts {
        let soft_timeout_sec = match average_sec {
            Some(avg) => avg
                .saturating_mul(self.average_multiplier)
                .max(self.least_timeout_sec),
            None => self.unknown_spec_timeout_sec,
        };
        TaskTimeouts {
            soft_timeout_sec,
            hard_timeout_sec: soft_timeout_sec.saturating_add(self.hard_timeout_margin_sec),
        }
    }
}
