//! Leased mutual exclusion built purely on [`Cache`] primitives.
//!
//! Ownership is proven by the lease id stored under the lock key. Release
//! and extension are compare-and-act operations on that id, so a holder
//! whose lease expired (and was re-acquired by someone else) can never
//! delete or refresh the new holder's lock. Every successful extension
//! rotates the lease id.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::{Cache, CacheKeys, to_chrono},
    config::LockConfig,
    error::{CoreError, Result},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A held lease on `key`. Valid only while `valid_until` is in the future.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLock {
    pub key: String,
    pub lease_id: LeaseId,
    pub valid_until: DateTime<Utc>,
    pub timeout: Duration,
}

impl CacheLock {
    pub fn new(
        key: String,
        lease_id: LeaseId,
        valid_until: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            lease_id,
            valid_until,
            timeout,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid_until > Utc::now()
    }

    /// Lease time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.valid_until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Lock service over the `Lock:` key namespace.
#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn Cache>,
    config: LockConfig,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(cache: Arc<dyn Cache>, config: LockConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Single attempt. `Ok(None)` means someone else holds the lock.
    pub async fn try_acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<CacheLock>> {
        self.cache
            .try_acquire(&CacheKeys::lock(name), timeout)
            .await
    }

    /// Retries [`DistributedLock::try_acquire`] until `wait` elapses.
    ///
    /// Backend errors are retried like contention; the last one is returned
    /// if the deadline passes without any successful answer.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
        wait: Duration,
    ) -> Result<CacheLock> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut last_error = None;

        loop {
            match self.try_acquire(name, timeout).await {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => last_error = None,
                Err(err) => {
                    warn!(lock = name, error = %err, "lock acquire attempt failed");
                    last_error = Some(err);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(last_error.unwrap_or_else(|| {
                    CoreError::LockUnavailable(format!(
                        "{name} still held after {wait:?}"
                    ))
                }));
            }
            let pause = self.config.retry_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// [`DistributedLock::acquire`] bounded by the configured
    /// `acquire_wait`.
    pub async fn acquire_default(&self, name: &str, timeout: Duration) -> Result<CacheLock> {
        self.acquire(name, timeout, self.config.acquire_wait).await
    }

    /// Like [`DistributedLock::acquire_default`] but returns a guard that
    /// releases the lock even if the owning task is cancelled.
    pub async fn acquire_guard(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let lock = self.acquire_default(name, timeout).await?;
        Ok(LockGuard::new(self.clone(), lock))
    }

    /// Deletes the lock only if `lock` still owns it. Returns `false` when
    /// the lease had already passed to another holder.
    pub async fn release(&self, lock: &CacheLock) -> Result<bool> {
        let released = self
            .cache
            .delete_if_equals(&lock.key, &lock.lease_id.to_bytes())
            .await?;
        if !released {
            debug!(key = %lock.key, lease = %lock.lease_id, "release skipped, lease no longer owned");
        }
        Ok(released)
    }

    /// Refreshes the lease, rotating its id. `Ok(None)` means ownership was
    /// lost and the caller must stop assuming exclusivity.
    pub async fn extend(
        &self,
        lock: &CacheLock,
        timeout: Option<Duration>,
    ) -> Result<Option<CacheLock>> {
        let timeout = timeout.unwrap_or(lock.timeout);
        let next = LeaseId::new();
        let started = Utc::now();
        let started_at = std::time::Instant::now();

        let extended = self
            .cache
            .replace_if_equals(
                &lock.key,
                &lock.lease_id.to_bytes(),
                next.to_bytes(),
                timeout,
            )
            .await?;
        if !extended {
            debug!(key = %lock.key, lease = %lock.lease_id, "extend refused, lease no longer owned");
            return Ok(None);
        }

        let spent = started_at.elapsed() + self.cache.clock_drift(timeout);
        let Some(validity) = timeout.checked_sub(spent) else {
            if let Err(err) = self.cache.delete_if_equals(&lock.key, &next.to_bytes()).await {
                warn!(key = %lock.key, error = %err, "failed to roll back late extension");
            }
            return Ok(None);
        };

        Ok(Some(CacheLock::new(
            lock.key.clone(),
            next,
            started + to_chrono(validity),
            timeout,
        )))
    }

    /// Runs `block` while keeping `lock` alive.
    ///
    /// The renewal loop sleeps until half of the remaining lease is gone and
    /// then extends. If an extension fails the block is dropped, since
    /// exclusivity can no longer be guaranteed, and `LockLost` is returned.
    /// The lock is released on every exit path.
    pub async fn with_lock<Fut, T>(&self, lock: CacheLock, block: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = LockGuard::new(self.clone(), lock);
        tokio::pin!(block);

        let outcome = loop {
            let Some(current) = guard.lock().cloned() else {
                break Err(CoreError::LockLost("lock guard emptied".into()));
            };
            let wait = current.remaining() / 2;

            tokio::select! {
                biased;
                out = &mut block => break out,
                _ = tokio::time::sleep(wait) => {
                    match self.extend(&current, None).await {
                        Ok(Some(next)) => guard.replace(next),
                        Ok(None) => {
                            warn!(key = %current.key, "lock lost during renewal, cancelling protected block");
                            guard.forget();
                            break Err(CoreError::LockLost(current.key.clone()));
                        }
                        Err(err) => {
                            warn!(key = %current.key, error = %err, "lock renewal failed, cancelling protected block");
                            break Err(CoreError::LockLost(format!("{}: {err}", current.key)));
                        }
                    }
                }
            }
        };

        let key = guard.lock().map(|lock| lock.key.clone());
        if let Err(err) = guard.release().await {
            warn!(key = ?key, error = %err, "lock release after protected block failed");
        }
        outcome
    }
}

/// Owns a [`CacheLock`] and releases it on drop.
///
/// Prefer [`LockGuard::release`]; the drop path spawns the release onto the
/// current runtime so it completes even while the owner is being cancelled.
#[derive(Debug)]
pub struct LockGuard {
    locks: DistributedLock,
    lock: Option<CacheLock>,
}

impl LockGuard {
    pub fn new(locks: DistributedLock, lock: CacheLock) -> Self {
        Self {
            locks,
            lock: Some(lock),
        }
    }

    pub fn lock(&self) -> Option<&CacheLock> {
        self.lock.as_ref()
    }

    fn replace(&mut self, lock: CacheLock) {
        self.lock = Some(lock);
    }

    /// Stops tracking the lock without releasing it.
    fn forget(&mut self) {
        self.lock = None;
    }

    pub async fn release(mut self) -> Result<bool> {
        match self.lock.take() {
            Some(lock) => self.locks.release(&lock).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let locks = self.locks.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = locks.release(&lock).await {
                        warn!(key = %lock.key, error = %err, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %lock.key, "no runtime to release lock, leaving it to expire");
            }
        }
    }
}
