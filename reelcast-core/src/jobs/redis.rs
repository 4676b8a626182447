//! Single-node Redis job backend.
//!
//! Dispatch lists are Redis lists (`LPUSH` / `RPOP`). Event logs are Redis
//! streams with one `data` field per entry; every append refreshes the
//! stream's retention TTL. Readers poll with non-blocking commands and sleep
//! `poll_interval` between empty rounds, so every read is a cancellation
//! point and no connection is held by a blocking command.

use std::{fmt, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager, streams::StreamRangeReply};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use super::{
    ClientEnvelope, JobId, WorkerEnvelope,
    backend::{EventStream, JobBackend, QueuedJob},
};
use crate::{
    cache::CacheKeys,
    config::JobQueueConfig,
    error::{CoreError, Result},
};

const DATA_FIELD: &str = "data";
const READ_BATCH: usize = 128;

#[derive(Clone)]
pub struct RedisJobBackend {
    conn: ConnectionManager,
    url: String,
    config: JobQueueConfig,
}

impl fmt::Debug for RedisJobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobBackend")
            .field("url", &self.url)
            .field("connection", &"ConnectionManager")
            .field("poll_interval", &self.config.poll_interval)
            .finish()
    }
}

impl RedisJobBackend {
    pub async fn connect(redis_url: &str, config: JobQueueConfig) -> Result<Self> {
        info!("Connecting to Redis job backend at {}", redis_url);

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            url: redis_url.to_string(),
            config,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn append<T: Serialize + Sync>(&self, key: &str, item: &T) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(payload)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(self.config.event_retention))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Replays the stream at `key` from the start, then polls for new
    /// entries. Runs until the consumer drops it.
    fn follow<T>(&self, key: String) -> EventStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut conn = self.conn.clone();
        let config = self.config;
        Box::pin(stream! {
            let mut last_id: Option<String> = None;
            loop {
                let start = match &last_id {
                    Some(id) => format!("({id}"),
                    None => "-".to_string(),
                };
                let reply: redis::RedisResult<StreamRangeReply> =
                    conn.xrange_count(&key, start, "+", READ_BATCH).await;
                match reply {
                    Ok(reply) => {
                        let full = reply.ids.len() >= READ_BATCH;
                        for entry in reply.ids {
                            last_id = Some(entry.id.clone());
                            let Some(payload) = entry.get::<String>(DATA_FIELD) else {
                                warn!(key = %key, id = %entry.id, "event entry without payload");
                                continue;
                            };
                            match serde_json::from_str::<T>(&payload) {
                                Ok(item) => yield Ok(item),
                                Err(err) => yield Err(CoreError::from(err)),
                            }
                        }
                        if !full {
                            tokio::time::sleep(config.poll_interval).await;
                        }
                    }
                    Err(err) => {
                        yield Err(CoreError::from(err));
                        tokio::time::sleep(config.error_backoff).await;
                    }
                }
            }
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl JobBackend for RedisJobBackend {
    async fn enqueue(&self, topic: &str, job: QueuedJob) -> Result<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let depth: i64 = conn.lpush(CacheKeys::job_queue(topic), payload).await?;
        debug!(topic, job = %job.job_id, depth, "job enqueued");
        Ok(())
    }

    fn jobs(&self, topic: &str) -> EventStream<QueuedJob> {
        let key = CacheKeys::job_queue(topic);
        let mut conn = self.conn.clone();
        let config = self.config;
        Box::pin(stream! {
            loop {
                let popped: redis::RedisResult<Option<String>> = conn.rpop(&key, None).await;
                match popped {
                    Ok(Some(payload)) => match serde_json::from_str::<QueuedJob>(&payload) {
                        Ok(job) => yield Ok(job),
                        Err(err) => yield Err(CoreError::from(err)),
                    },
                    Ok(None) => tokio::time::sleep(config.poll_interval).await,
                    Err(err) => {
                        yield Err(CoreError::from(err));
                        tokio::time::sleep(config.error_backoff).await;
                    }
                }
            }
        })
    }

    async fn push_worker_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &WorkerEnvelope,
    ) -> Result<()> {
        self.append(&CacheKeys::job_worker_events(topic, job_id), envelope)
            .await
    }

    fn worker_events(&self, topic: &str, job_id: JobId) -> EventStream<WorkerEnvelope> {
        self.follow(CacheKeys::job_worker_events(topic, job_id))
    }

    async fn push_client_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &ClientEnvelope,
    ) -> Result<()> {
        self.append(&CacheKeys::job_client_events(topic, job_id), envelope)
            .await
    }

    fn client_events(&self, topic: &str, job_id: JobId) -> EventStream<ClientEnvelope> {
        self.follow(CacheKeys::job_client_events(topic, job_id))
    }

    async fn delete(&self, topic: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(vec![
                CacheKeys::job_worker_events(topic, job_id),
                CacheKeys::job_client_events(topic, job_id),
            ])
            .await?;
        debug!(topic, job = %job_id, removed, "job event logs deleted");
        Ok(())
    }
}
