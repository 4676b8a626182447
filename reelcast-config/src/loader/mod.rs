pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use reelcast_core::{CacheConfig, CoreConfig, JobQueueConfig, LockConfig, StreamConfig};

use self::error::ConfigLoadError;
use crate::{
    models::{
        Config, ConfigMetadata, LoggingConfig,
        sources::{
            EnvConfig, FileCacheConfig, FileConfig, FileJobsConfig, FileLockConfig,
            FileStreamConfig,
        },
    },
    util::parse_duration,
    validation::{self, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["reelcast.toml", "config/reelcast.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Layers defaults, the TOML file and the environment into a [`Config`].
///
/// Precedence, lowest first: built-in defaults, the config file (explicit
/// path, then `REELCAST_CONFIG`, then the default locations), the process
/// environment. A `.env` file only fills variables that are not already set.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = EnvConfig::gather();
        let (file, config_path) = self.load_file_config(&env)?;

        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No reelcast.toml detected; using defaults and environment variables",
                "Set REELCAST_CONFIG or place reelcast.toml in the working directory",
            );
        }

        let config = compose(
            file.unwrap_or_default(),
            env,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;
        warnings.extend(validation::apply_guard_rails(&config)?);

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn compose(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        cache: file_cache,
        lock: file_lock,
        jobs: file_jobs,
        stream: file_stream,
        logging: file_logging,
    } = file;

    let core = CoreConfig {
        cache: resolve_cache(&env, file_cache)?,
        lock: resolve_lock(&env, &file_lock)?,
        jobs: resolve_jobs(&env, &file_jobs)?,
        stream: resolve_stream(&env, &file_stream)?,
    };

    let logging = LoggingConfig {
        filter: env
            .log_filter
            .or(file_logging.filter)
            .unwrap_or_else(|| LoggingConfig::default().filter),
    };

    Ok(Config {
        core,
        logging,
        metadata,
    })
}

fn resolve_cache(env: &EnvConfig, file: FileCacheConfig) -> Result<CacheConfig, ConfigLoadError> {
    let url = env.redis_url.clone().or(file.url);
    let nodes = env
        .redis_cluster_nodes
        .clone()
        .or(file.nodes)
        .filter(|nodes| !nodes.is_empty());

    let (setting, backend) = match &env.cache_backend {
        Some(backend) => ("CACHE_BACKEND", Some(backend.clone())),
        None => ("cache.backend", file.backend),
    };

    let backend = match backend {
        Some(raw) => {
            let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
            match normalized.as_str() {
                "in_memory" | "memory" => "in_memory",
                "redis" => "redis",
                "cluster" => "cluster",
                _ => {
                    return Err(ConfigLoadError::InvalidValue {
                        setting,
                        value: raw,
                        reason: "expected in_memory, redis or cluster".into(),
                    });
                }
            }
        }
        None if nodes.is_some() => "cluster",
        None if url.is_some() => "redis",
        None => "in_memory",
    };

    match backend {
        "redis" => url
            .map(|url| CacheConfig::Redis { url })
            .ok_or(ConfigLoadError::MissingSetting {
                setting: "REDIS_URL",
                backend: "redis",
            }),
        "cluster" => nodes
            .map(|nodes| CacheConfig::Cluster { nodes })
            .ok_or(ConfigLoadError::MissingSetting {
                setting: "REDIS_CLUSTER_NODES",
                backend: "cluster",
            }),
        _ => Ok(CacheConfig::InMemory),
    }
}

fn resolve_lock(env: &EnvConfig, file: &FileLockConfig) -> Result<LockConfig, ConfigLoadError> {
    let defaults = LockConfig::default();
    let clock_drift_factor = match &env.lock_clock_drift_factor {
        Some(raw) => parse_value("LOCK_CLOCK_DRIFT_FACTOR", raw)?,
        None => file.clock_drift_factor.unwrap_or(defaults.clock_drift_factor),
    };
    Ok(LockConfig {
        acquire_wait: duration(
            ("LOCK_ACQUIRE_WAIT", env.lock_acquire_wait.as_deref()),
            ("lock.acquire_wait", file.acquire_wait.as_deref()),
            defaults.acquire_wait,
        )?,
        retry_interval: duration(
            ("LOCK_RETRY_INTERVAL", env.lock_retry_interval.as_deref()),
            ("lock.retry_interval", file.retry_interval.as_deref()),
            defaults.retry_interval,
        )?,
        clock_drift_factor,
    })
}

fn resolve_jobs(env: &EnvConfig, file: &FileJobsConfig) -> Result<JobQueueConfig, ConfigLoadError> {
    let defaults = JobQueueConfig::default();
    let max_concurrent_jobs = match &env.job_max_concurrency {
        Some(raw) => parse_value("JOB_MAX_CONCURRENCY", raw)?,
        None => file.max_concurrent_jobs.unwrap_or(defaults.max_concurrent_jobs),
    };
    Ok(JobQueueConfig {
        event_retention: duration(
            ("JOB_EVENT_RETENTION", env.job_event_retention.as_deref()),
            ("jobs.event_retention", file.event_retention.as_deref()),
            defaults.event_retention,
        )?,
        poll_interval: duration(
            ("JOB_POLL_INTERVAL", env.job_poll_interval.as_deref()),
            ("jobs.poll_interval", file.poll_interval.as_deref()),
            defaults.poll_interval,
        )?,
        max_concurrent_jobs,
        error_backoff: duration(
            ("JOB_ERROR_BACKOFF", env.job_error_backoff.as_deref()),
            ("jobs.error_backoff", file.error_backoff.as_deref()),
            defaults.error_backoff,
        )?,
    })
}

fn resolve_stream(
    env: &EnvConfig,
    file: &FileStreamConfig,
) -> Result<StreamConfig, ConfigLoadError> {
    let defaults = StreamConfig::default();
    Ok(StreamConfig {
        artifact_ttl: duration(
            ("STREAM_ARTIFACT_TTL", env.stream_artifact_ttl.as_deref()),
            ("stream.artifact_ttl", file.artifact_ttl.as_deref()),
            defaults.artifact_ttl,
        )?,
        placeholder_ttl: duration(
            ("STREAM_PLACEHOLDER_TTL", env.stream_placeholder_ttl.as_deref()),
            ("stream.placeholder_ttl", file.placeholder_ttl.as_deref()),
            defaults.placeholder_ttl,
        )?,
        session_ttl: duration(
            ("STREAM_SESSION_TTL", env.stream_session_ttl.as_deref()),
            ("stream.session_ttl", file.session_ttl.as_deref()),
            defaults.session_ttl,
        )?,
        heartbeat_dead_window: duration(
            (
                "STREAM_HEARTBEAT_DEAD_WINDOW",
                env.stream_heartbeat_dead_window.as_deref(),
            ),
            (
                "stream.heartbeat_dead_window",
                file.heartbeat_dead_window.as_deref(),
            ),
            defaults.heartbeat_dead_window,
        )?,
        watchdog_interval: duration(
            ("STREAM_WATCHDOG_INTERVAL", env.stream_watchdog_interval.as_deref()),
            ("stream.watchdog_interval", file.watchdog_interval.as_deref()),
            defaults.watchdog_interval,
        )?,
        lock_timeout: duration(
            ("STREAM_LOCK_TIMEOUT", env.stream_lock_timeout.as_deref()),
            ("stream.lock_timeout", file.lock_timeout.as_deref()),
            defaults.lock_timeout,
        )?,
        lock_wait: duration(
            ("STREAM_LOCK_WAIT", env.stream_lock_wait.as_deref()),
            ("stream.lock_wait", file.lock_wait.as_deref()),
            defaults.lock_wait,
        )?,
    })
}

/// Environment value if set, else the file value, else `default`.
fn duration(
    env: (&'static str, Option<&str>),
    file: (&'static str, Option<&str>),
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    let (setting, raw) = match (env, file) {
        ((setting, Some(raw)), _) | (_, (setting, Some(raw))) => (setting, raw),
        _ => return Ok(default),
    };
    parse_duration(raw).map_err(|source| ConfigLoadError::InvalidDuration {
        setting,
        value: raw.to_string(),
        source,
    })
}

fn parse_value<T>(setting: &'static str, raw: &str) -> Result<T, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err: T::Err| ConfigLoadError::InvalidValue {
            setting,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}
