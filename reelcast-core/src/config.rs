//! Runtime configuration consumed by the core constructors.
//!
//! These types carry no loading logic; `reelcast-config` resolves them from
//! files and the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which backend tier serves the cache, the locks and the job queues.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Single-process map. Nothing is shared across processes.
    #[default]
    InMemory,
    /// One external Redis node.
    Redis { url: String },
    /// Independent Redis nodes; every operation needs a strict majority.
    Cluster { nodes: Vec<String> },
}

impl CacheConfig {
    pub fn node_count(&self) -> usize {
        match self {
            CacheConfig::InMemory | CacheConfig::Redis { .. } => 1,
            CacheConfig::Cluster { nodes } => nodes.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Total time `DistributedLock::acquire` keeps retrying.
    pub acquire_wait: Duration,
    /// Pause between two acquire attempts.
    pub retry_interval: Duration,
    /// Fraction of the lease subtracted from cluster lock validity to
    /// account for clock drift between nodes.
    pub clock_drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
            clock_drift_factor: 0.01,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// How long a job's event logs survive after their last write.
    pub event_retention: Duration,
    /// Pause between two empty polls of an external dispatch list or event
    /// log.
    pub poll_interval: Duration,
    /// Jobs a single registered worker runs concurrently.
    pub max_concurrent_jobs: usize,
    /// Pause after a backend error inside a long-lived loop.
    pub error_backoff: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            event_retention: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(1),
            max_concurrent_jobs: 8,
            error_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Rolling window every heartbeat pushes artifact expiry out to.
    pub artifact_ttl: Duration,
    /// Lifetime of the empty metadata record written before the job runs.
    pub placeholder_ttl: Duration,
    /// Lifetime of the session -> stream mapping written at creation.
    pub session_ttl: Duration,
    /// Silence after which the worker assumes the client is gone.
    pub heartbeat_dead_window: Duration,
    /// How often the worker checks the dead window.
    pub watchdog_interval: Duration,
    /// Lease on the per-session lock held while a stream is (re)created.
    pub lock_timeout: Duration,
    /// Total time spent trying to obtain the per-session lock.
    pub lock_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            artifact_ttl: Duration::from_secs(60),
            placeholder_ttl: Duration::from_secs(30),
            session_ttl: Duration::from_secs(120),
            heartbeat_dead_window: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
        }
    }
}

/// Aggregate handed to [`crate::Runtime::connect`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub jobs: JobQueueConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}
