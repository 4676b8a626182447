//! Keyed byte storage with absolute expiry and a lease-lock side channel.
//!
//! Three tiers implement [`Cache`]: [`InMemoryCache`] for a single process,
//! `RedisCache` for one external node and `ClusterCache` for a set of
//! independent nodes that must agree by strict majority. Every operation is
//! atomic for a single key relative to its backend. Backend unavailability
//! surfaces as an error; nothing in here retries.

pub mod cluster;
pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    config::{CacheConfig, LockConfig},
    error::{CoreError, Result},
    lock::{CacheLock, LeaseId},
};

pub use cluster::ClusterCache;
pub use keys::CacheKeys;
pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Backend contract shared by every cache tier.
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` until `expire_at`. A timestamp in the past removes the
    /// key instead.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns whether a live key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Moves the expiry of an existing key. Returns `false` when the key is
    /// absent.
    async fn expire(&self, key: &str, expire_at: DateTime<Utc>) -> Result<bool>;

    /// Sets `key` only if it is currently unset.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Replaces value and lifetime of `key` only while it still holds
    /// `expected`.
    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Validity lost to clock drift for a lease of `ttl`. Zero for tiers
    /// with a single clock.
    fn clock_drift(&self, _ttl: Duration) -> Duration {
        Duration::ZERO
    }

    /// Takes the lease lock stored at `key` if nobody holds it.
    ///
    /// Contention is an expected outcome and yields `Ok(None)`.
    async fn try_acquire(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<CacheLock>> {
        let lease_id = LeaseId::new();
        let started = Utc::now();
        let started_at = std::time::Instant::now();

        if !self
            .set_if_absent(key, lease_id.to_bytes(), timeout)
            .await?
        {
            debug!(key, "lock contended");
            return Ok(None);
        }

        let spent = started_at.elapsed() + self.clock_drift(timeout);
        let Some(validity) = timeout.checked_sub(spent) else {
            // Acquired too late to be useful; hand the key back.
            self.delete_if_equals(key, &lease_id.to_bytes()).await?;
            return Ok(None);
        };

        Ok(Some(CacheLock::new(
            key.to_string(),
            lease_id,
            started + to_chrono(validity),
            timeout,
        )))
    }
}

/// Convenience codecs layered over any [`Cache`].
#[async_trait]
pub trait CacheExt: Cache {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key).await? {
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|err| {
                CoreError::Invalid(format!("cache value at {key} is not utf-8: {err}"))
            }),
            None => Ok(None),
        }
    }

    async fn put_string(
        &self,
        key: &str,
        value: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        self.put(key, value.as_bytes().to_vec(), expire_at).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        self.put(key, json, expire_at).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Absolute expiry `ttl` from now.
pub fn expire_in(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + to_chrono(ttl)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Builds the cache tier selected by `config`.
pub async fn connect(
    config: &CacheConfig,
    lock: &LockConfig,
) -> Result<Arc<dyn Cache>> {
    match config {
        CacheConfig::InMemory => Ok(Arc::new(InMemoryCache::new())),
        #[cfg(feature = "redis")]
        CacheConfig::Redis { url } => Ok(Arc::new(RedisCache::connect(url).await?)),
        #[cfg(feature = "redis")]
        CacheConfig::Cluster { nodes } => {
            let mut members: Vec<Arc<dyn Cache>> = Vec::with_capacity(nodes.len());
            for url in nodes {
                members.push(Arc::new(RedisCache::connect(url).await?));
            }
            Ok(Arc::new(ClusterCache::new(members, lock.clock_drift_factor)?))
        }
        #[cfg(not(feature = "redis"))]
        other => {
            let _ = lock;
            Err(CoreError::Invalid(format!(
                "cache backend {other:?} requires the `redis` feature"
            )))
        }
    }
}
