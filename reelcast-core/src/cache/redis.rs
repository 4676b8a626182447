use std::{fmt, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tracing::{debug, info};

use super::Cache;
use crate::error::Result;

/// Redis scripts for the compare-and-act lock primitives.
mod scripts {
    use redis::Script;

    /// Delete the key only while it still holds the caller's lease.
    pub fn compare_and_delete() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }

    /// Rotate the stored lease and its TTL only while the caller owns it.
    pub fn compare_and_replace() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
                return 1
            end
            return 0
            "#,
        )
    }
}

static COMPARE_AND_DELETE: LazyLock<Script> =
    LazyLock::new(scripts::compare_and_delete);
static COMPARE_AND_REPLACE: LazyLock<Script> =
    LazyLock::new(scripts::compare_and_replace);

/// Single external-node cache tier.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    url: String,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.url)
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis cache at {}", redis_url);

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Successfully connected to Redis cache");

        Ok(Self {
            conn,
            url: redis_url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        debug!(key, hit = value.is_some(), "Cache GET");
        Ok(value)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        if expire_at <= Utc::now() {
            let _: i64 = conn.del(key).await?;
            return Ok(());
        }
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PXAT")
            .arg(expire_at.timestamp_millis())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, expire_at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIREAT")
            .arg(key)
            .arg(expire_at.timestamp_millis())
            .query_async(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let replaced: i64 = COMPARE_AND_REPLACE
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced > 0)
    }
}
