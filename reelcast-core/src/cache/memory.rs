use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Cache, to_chrono};
use crate::error::Result;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Vec<u8>,
    expire_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expire_at > now
    }
}

/// Process-local cache tier. Expired entries are invisible to every read and
/// are reclaimed lazily or by [`InMemoryCache::spawn_sweeper`].
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "purged expired cache entries");
        }
        removed
    }

    /// Runs [`InMemoryCache::purge_expired`] every `interval` until
    /// `shutdown` fires.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.purge_expired();
                    }
                }
            }
        })
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Utc::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_value(key))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        if expire_at <= Utc::now() {
            self.entries.remove(key);
            return Ok(());
        }
        trace!(key, bytes = value.len(), "cache put");
        self.entries
            .insert(key.to_string(), CacheEntry { value, expire_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn expire(&self, key: &str, expire_at: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(false);
                }
                if expire_at <= now {
                    occupied.remove();
                } else {
                    occupied.get_mut().expire_at = expire_at;
                }
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let entry = CacheEntry {
            value,
            expire_at: now + to_chrono(ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(entry);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| {
                entry.is_live(now) && entry.value == expected
            })
            .is_some())
    }

    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.value == expected => {
                entry.value = value;
                entry.expire_at = now + to_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
