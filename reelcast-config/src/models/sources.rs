use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{non_empty_var, parse_csv_var};

/// Raw configuration as defined in a TOML file. Durations are kept as the
/// human readable strings found in the file and parsed during composition.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub lock: FileLockConfig,
    #[serde(default)]
    pub jobs: FileJobsConfig,
    #[serde(default)]
    pub stream: FileStreamConfig,
    #[serde(default)]
    pub logging: FileLoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCacheConfig {
    /// `in_memory`, `redis` or `cluster`. Inferred from `url` / `nodes`
    /// when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLockConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_wait: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_drift_factor: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileJobsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_retention: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_backoff: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_dead_window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_wait: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Environment-derived configuration values, still unparsed where parsing
/// can fail so errors can name the variable.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub cache_backend: Option<String>,
    pub redis_url: Option<String>,
    pub redis_cluster_nodes: Option<Vec<String>>,
    pub lock_acquire_wait: Option<String>,
    pub lock_retry_interval: Option<String>,
    pub lock_clock_drift_factor: Option<String>,
    pub job_event_retention: Option<String>,
    pub job_poll_interval: Option<String>,
    pub job_max_concurrency: Option<String>,
    pub job_error_backoff: Option<String>,
    pub stream_artifact_ttl: Option<String>,
    pub stream_placeholder_ttl: Option<String>,
    pub stream_session_ttl: Option<String>,
    pub stream_heartbeat_dead_window: Option<String>,
    pub stream_watchdog_interval: Option<String>,
    pub stream_lock_timeout: Option<String>,
    pub stream_lock_wait: Option<String>,
    pub log_filter: Option<String>,
}

impl EnvConfig {
    /// Every variable [`EnvConfig::gather`] reads.
    pub const KEYS: &'static [&'static str] = &[
        "REELCAST_CONFIG",
        "CACHE_BACKEND",
        "REDIS_URL",
        "REDIS_CLUSTER_NODES",
        "LOCK_ACQUIRE_WAIT",
        "LOCK_RETRY_INTERVAL",
        "LOCK_CLOCK_DRIFT_FACTOR",
        "JOB_EVENT_RETENTION",
        "JOB_POLL_INTERVAL",
        "JOB_MAX_CONCURRENCY",
        "JOB_ERROR_BACKOFF",
        "STREAM_ARTIFACT_TTL",
        "STREAM_PLACEHOLDER_TTL",
        "STREAM_SESSION_TTL",
        "STREAM_HEARTBEAT_DEAD_WINDOW",
        "STREAM_WATCHDOG_INTERVAL",
        "STREAM_LOCK_TIMEOUT",
        "STREAM_LOCK_WAIT",
        "REELCAST_LOG",
    ];

    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("REELCAST_CONFIG").map(PathBuf::from),
            cache_backend: non_empty_var("CACHE_BACKEND"),
            redis_url: non_empty_var("REDIS_URL"),
            redis_cluster_nodes: parse_csv_var("REDIS_CLUSTER_NODES")
                .filter(|nodes| !nodes.is_empty()),
            lock_acquire_wait: non_empty_var("LOCK_ACQUIRE_WAIT"),
            lock_retry_interval: non_empty_var("LOCK_RETRY_INTERVAL"),
            lock_clock_drift_factor: non_empty_var("LOCK_CLOCK_DRIFT_FACTOR"),
            job_event_retention: non_empty_var("JOB_EVENT_RETENTION"),
            job_poll_interval: non_empty_var("JOB_POLL_INTERVAL"),
            job_max_concurrency: non_empty_var("JOB_MAX_CONCURRENCY"),
            job_error_backoff: non_empty_var("JOB_ERROR_BACKOFF"),
            stream_artifact_ttl: non_empty_var("STREAM_ARTIFACT_TTL"),
            stream_placeholder_ttl: non_empty_var("STREAM_PLACEHOLDER_TTL"),
            stream_session_ttl: non_empty_var("STREAM_SESSION_TTL"),
            stream_heartbeat_dead_window: non_empty_var("STREAM_HEARTBEAT_DEAD_WINDOW"),
            stream_watchdog_interval: non_empty_var("STREAM_WATCHDOG_INTERVAL"),
            stream_lock_timeout: non_empty_var("STREAM_LOCK_TIMEOUT"),
            stream_lock_wait: non_empty_var("STREAM_LOCK_WAIT"),
            log_filter: non_empty_var("REELCAST_LOG"),
        }
    }
}
