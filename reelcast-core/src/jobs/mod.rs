//! Asynchronous, cancellable jobs across process boundaries.
//!
//! A [`JobTopic`] names a logical queue and its payload types. Producers
//! `submit` requests and follow them with `monitor`; workers `register` a
//! [`JobHandler`]. Clients talk to a running job through `cancel` and
//! `notify`. The transport is a [`JobBackend`]: in-process channels, a single
//! Redis node, or a quorum of Redis nodes. Payloads travel as JSON strings so
//! every backend stays agnostic of topic types.

pub mod backend;
pub mod cluster;
pub mod memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    cache::Cache,
    config::{CacheConfig, JobQueueConfig},
    error::{CoreError, Result},
};

pub use backend::{EventStream, JobBackend, QueuedJob};
pub use cluster::ClusterJobBackend;
pub use memory::InMemoryJobBackend;
pub use queue::{JobContext, JobEmitter, JobHandler, JobQueue, WorkerHandle};
#[cfg(feature = "redis")]
pub use self::redis::RedisJobBackend;
pub use registry::JobQueueRegistry;

/// Unique identifier for a submitted job. Never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|err| CoreError::Invalid(format!("invalid job id {s:?}: {err}")))
    }
}

/// Client -> worker signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent<E> {
    /// Terminal for the receiving job.
    Cancel,
    Event(E),
    NoOp,
}

/// Worker -> monitor signal. `Success` and `Fail` are terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkerEvent<E, R> {
    Event(E),
    Success(R),
    Fail(String),
}

impl<E, R> WorkerEvent<E, R> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Success(_) | WorkerEvent::Fail(_))
    }
}

/// A named logical queue and the payload types flowing through it.
pub trait JobTopic: Send + Sync + 'static {
    /// Stable identifier shared by every process using this topic.
    const NAME: &'static str;

    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
    type ClientEvent: Serialize + DeserializeOwned + Send + Sync + 'static;
    type WorkerEvent: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Worker event as stored by a backend. `seq` is assigned by the single
/// worker running the job and increases by one per event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub seq: u64,
    pub event: WorkerEvent<String, String>,
}

/// Client event as stored by a backend. `id` lets replicated backends drop
/// duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub id: Uuid,
    pub event: ClientEvent<String>,
}

impl ClientEnvelope {
    pub fn new(event: ClientEvent<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event,
        }
    }
}

/// Builds the job backend tier matching `config`.
///
/// `claims` is only used by the cluster tier, where it must be the quorum
/// cache over the same node set.
pub async fn connect(
    config: &CacheConfig,
    jobs: &JobQueueConfig,
    claims: Arc<dyn Cache>,
) -> Result<Arc<dyn JobBackend>> {
    match config {
        CacheConfig::InMemory => Ok(Arc::new(InMemoryJobBackend::new(*jobs))),
        #[cfg(feature = "redis")]
        CacheConfig::Redis { url } => {
            Ok(Arc::new(RedisJobBackend::connect(url, *jobs).await?))
        }
        #[cfg(feature = "redis")]
        CacheConfig::Cluster { nodes } => {
            let mut members: Vec<Arc<dyn JobBackend>> = Vec::with_capacity(nodes.len());
            for url in nodes {
                members.push(Arc::new(RedisJobBackend::connect(url, *jobs).await?));
            }
            Ok(Arc::new(ClusterJobBackend::new(members, claims, *jobs)?))
        }
        #[cfg(not(feature = "redis"))]
        other => {
            let _ = claims;
            Err(CoreError::Invalid(format!(
                "job backend {other:?} requires the `redis` feature"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(WorkerEvent::<(), u8>::Success(1).is_terminal());
        assert!(WorkerEvent::<(), u8>::Fail("boom".into()).is_terminal());
        assert!(!WorkerEvent::<u8, ()>::Event(1).is_terminal());
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().expect("parse"), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
