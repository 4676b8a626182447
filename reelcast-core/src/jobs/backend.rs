use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::{ClientEnvelope, JobId, WorkerEnvelope};
use crate::error::Result;

/// Live sequence of backend items. Errors are reported in-band and do not
/// end the stream; callers decide whether to keep reading.
pub type EventStream<T> = BoxStream<'static, Result<T>>;

/// A request waiting in a topic's dispatch list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    /// JSON encoded `JobTopic::Request`.
    pub request: String,
}

/// Transport shared by every typed [`super::JobQueue`].
///
/// Dispatch is a queue: each queued job is handed to at most one consumer.
/// Event logs are append-only and replayable, so any number of readers see
/// the full history followed by live events. Logs expire after the
/// configured retention once writes stop.
#[async_trait]
pub trait JobBackend: Send + Sync + fmt::Debug {
    async fn enqueue(&self, topic: &str, job: QueuedJob) -> Result<()>;

    /// Endless stream of dequeued jobs. A job is removed from the queue only
    /// when the stream is polled, so consumers control their intake.
    fn jobs(&self, topic: &str) -> EventStream<QueuedJob>;

    async fn push_worker_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &WorkerEnvelope,
    ) -> Result<()>;

    /// Replays then follows the worker events of `job_id`.
    fn worker_events(&self, topic: &str, job_id: JobId) -> EventStream<WorkerEnvelope>;

    async fn push_client_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &ClientEnvelope,
    ) -> Result<()>;

    /// Replays then follows the client events of `job_id`.
    fn client_events(&self, topic: &str, job_id: JobId) -> EventStream<ClientEnvelope>;

    /// Drops both event logs of `job_id`.
    async fn delete(&self, topic: &str, job_id: JobId) -> Result<()>;
}
