use std::{
    fs,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use reelcast_config::{ConfigLoadError, ConfigLoader, EnvConfig};
use reelcast_core::CacheConfig;
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests touching the process environment and clears every
/// variable the loader reads.
fn clean_env() -> MutexGuard<'static, ()> {
    let guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for key in EnvConfig::KEYS {
        unsafe { std::env::remove_var(key) };
    }
    guard
}

#[test]
fn file_values_apply_and_environment_wins() {
    let _guard = clean_env();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("reelcast.toml");
    fs::write(
        &path,
        r#"
[cache]
backend = "cluster"
nodes = ["redis://a:6379", "redis://b:6379", "redis://c:6379"]

[jobs]
max_concurrent_jobs = 2
poll_interval = "250ms"

[stream]
artifact_ttl = "90s"
heartbeat_dead_window = "20s"

[logging]
filter = "debug"
"#,
    )
    .expect("write config");

    unsafe { std::env::set_var("STREAM_ARTIFACT_TTL", "2m") };
    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join("missing.env"))
        .load()
        .expect("load");

    let core = &load.config.core;
    assert_eq!(
        core.cache,
        CacheConfig::Cluster {
            nodes: vec![
                "redis://a:6379".into(),
                "redis://b:6379".into(),
                "redis://c:6379".into(),
            ]
        }
    );
    assert_eq!(core.jobs.max_concurrent_jobs, 2);
    assert_eq!(core.jobs.poll_interval, Duration::from_millis(250));
    assert_eq!(core.stream.artifact_ttl, Duration::from_secs(120));
    assert_eq!(core.stream.heartbeat_dead_window, Duration::from_secs(20));
    assert_eq!(load.config.logging.filter, "debug");
    assert_eq!(load.config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert!(!load.config.metadata.env_file_loaded);
    assert!(load.warnings.is_empty(), "{:?}", load.warnings);

    unsafe { std::env::remove_var("STREAM_ARTIFACT_TTL") };
}

#[test]
fn env_file_selects_the_redis_backend() {
    let _guard = clean_env();
    let dir = tempdir().expect("tempdir");
    let env_file = dir.path().join(".env");
    fs::write(&env_file, "REDIS_URL=redis://cache:6379\nJOB_MAX_CONCURRENCY=3\n")
        .expect("write env");

    let load = ConfigLoader::new()
        .with_config_path(write_empty_config(dir.path()))
        .with_env_file(&env_file)
        .load()
        .expect("load");

    assert!(load.config.metadata.env_file_loaded);
    assert_eq!(
        load.config.core.cache,
        CacheConfig::Redis {
            url: "redis://cache:6379".into()
        }
    );
    assert_eq!(load.config.core.jobs.max_concurrent_jobs, 3);

    for key in EnvConfig::KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
fn explicit_missing_file_is_an_error() {
    let _guard = clean_env();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join("missing.env"))
        .load()
        .expect_err("missing file");
    assert!(matches!(err, ConfigLoadError::MissingConfig { path: p } if p == path));
}

#[test]
fn guard_rails_reject_inconsistent_ttls() {
    let _guard = clean_env();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("reelcast.toml");
    fs::write(
        &path,
        "[stream]\nplaceholder_ttl = \"5m\"\nsession_ttl = \"1m\"\n",
    )
    .expect("write config");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join("missing.env"))
        .load()
        .expect_err("placeholder outlives session");
    assert!(matches!(err, ConfigLoadError::GuardRail(_)), "{err}");
}

#[test]
fn malformed_toml_reports_its_path() {
    let _guard = clean_env();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("reelcast.toml");
    fs::write(&path, "[cache\nbackend = ").expect("write config");

    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(dir.path().join("missing.env"))
        .load()
        .expect_err("parse error");
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
    assert!(err.to_string().contains("reelcast.toml"));
}

fn write_empty_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("reelcast.toml");
    fs::write(&path, "").expect("write config");
    path
}
