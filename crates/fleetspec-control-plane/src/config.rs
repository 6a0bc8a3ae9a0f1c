//! Control plane configuration.

use std::time::Duration;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-lines RPC bind address.
    pub bind_addr: String,

    /// HTTP admin server bind address.
    pub http_bind_addr: String,

    /// Workers not heard from within this window are dropped (seconds).
    pub worker_staleness_secs: u64,

    /// How long a computed duration average stays cached (seconds).
    pub average_ttl_secs: u64,

    /// Most recent trials considered for an average.
    pub average_sample_limit: usize,

    /// Upper bound on handling one call (seconds).
    pub call_timeout_secs: u64,

    /// Longest accepted line on a connection (bytes).
    pub max_frame_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9999".to_string(),
            http_bind_addr: "127.0.0.1:9998".to_string(),
            worker_staleness_secs: 60,
            average_ttl_secs: 24 * 60 * 60,
            average_sample_limit: 100,
            call_timeout_secs: 30,
            max_frame_length: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn worker_staleness(&self) -> Duration {
        Duration::from_secs(self.worker_staleness_secs)
    }

    pub fn average_ttl(&self) -> Duration {
        Duration::from_secs(self.average_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
