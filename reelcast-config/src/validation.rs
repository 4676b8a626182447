use std::time::Duration;

use reelcast_core::CacheConfig;
use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{setting} must be greater than zero")]
    ZeroDuration { setting: &'static str },
    #[error("JOB_MAX_CONCURRENCY must be at least 1")]
    NoJobConcurrency,
    #[error("cluster backend configured without any node")]
    EmptyCluster,
    #[error(
        "placeholder TTL ({placeholder:?}) exceeds session TTL ({session:?}); the session mapping would expire before its stream metadata"
    )]
    PlaceholderOutlivesSession { placeholder: Duration, session: Duration },
    #[error("clock drift factor {0} must lie in [0, 0.5)")]
    InvalidDriftFactor(f64),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// Emits every warning through `tracing`.
    pub fn log(&self) {
        for warning in &self.items {
            match &warning.hint {
                Some(hint) => tracing::warn!(hint = %hint, "{}", warning.message),
                None => tracing::warn!("{}", warning.message),
            }
        }
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let core = &config.core;

    for (setting, value) in [
        ("STREAM_ARTIFACT_TTL", core.stream.artifact_ttl),
        ("STREAM_PLACEHOLDER_TTL", core.stream.placeholder_ttl),
        ("STREAM_SESSION_TTL", core.stream.session_ttl),
        ("STREAM_HEARTBEAT_DEAD_WINDOW", core.stream.heartbeat_dead_window),
        ("STREAM_WATCHDOG_INTERVAL", core.stream.watchdog_interval),
        ("STREAM_LOCK_TIMEOUT", core.stream.lock_timeout),
        ("JOB_EVENT_RETENTION", core.jobs.event_retention),
        ("JOB_POLL_INTERVAL", core.jobs.poll_interval),
        ("LOCK_RETRY_INTERVAL", core.lock.retry_interval),
    ] {
        if value.is_zero() {
            return Err(ConfigGuardRailError::ZeroDuration { setting });
        }
    }

    if core.jobs.max_concurrent_jobs == 0 {
        return Err(ConfigGuardRailError::NoJobConcurrency);
    }

    if core.stream.placeholder_ttl > core.stream.session_ttl {
        return Err(ConfigGuardRailError::PlaceholderOutlivesSession {
            placeholder: core.stream.placeholder_ttl,
            session: core.stream.session_ttl,
        });
    }

    let drift = core.lock.clock_drift_factor;
    if !(0.0..0.5).contains(&drift) {
        return Err(ConfigGuardRailError::InvalidDriftFactor(drift));
    }

    match &core.cache {
        CacheConfig::InMemory => warnings.push_with_hint(
            "In-memory cache backend selected; locks, jobs and streams are not shared across processes",
            "Set REDIS_URL or REDIS_CLUSTER_NODES for multi-process deployments",
        ),
        CacheConfig::Redis { .. } => {}
        CacheConfig::Cluster { nodes } if nodes.is_empty() => {
            return Err(ConfigGuardRailError::EmptyCluster);
        }
        CacheConfig::Cluster { nodes } => {
            if nodes.len() < 3 {
                warnings.push_with_hint(
                    format!(
                        "Cluster of {} node(s) tolerates no node failure",
                        nodes.len()
                    ),
                    "Use at least 3 independent nodes",
                );
            } else if nodes.len() % 2 == 0 {
                warnings.push_with_hint(
                    format!(
                        "Cluster of {} nodes tolerates no more failures than {} nodes would",
                        nodes.len(),
                        nodes.len() - 1
                    ),
                    "Use an odd number of nodes",
                );
            }
        }
    }

    if core.stream.watchdog_interval >= core.stream.heartbeat_dead_window {
        warnings.push(format!(
            "STREAM_WATCHDOG_INTERVAL ({:?}) is not shorter than the heartbeat dead window ({:?}); abandoned streams will linger",
            core.stream.watchdog_interval, core.stream.heartbeat_dead_window
        ));
    }

    if core.stream.artifact_ttl < core.stream.heartbeat_dead_window {
        warnings.push_with_hint(
            "STREAM_ARTIFACT_TTL is shorter than the heartbeat dead window",
            "Artifacts may expire under a live transcode between heartbeats",
        );
    }

    Ok(warnings)
}
