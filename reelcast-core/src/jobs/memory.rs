//! In-process job backend.
//!
//! Dispatch lists are `VecDeque`s woken through `Notify`; event logs are
//! append-only vectors whose readers follow a `watch` version counter. Nothing
//! leaves the process, so this tier only coordinates tasks of one server.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_stream::stream;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    sync::{Mutex, Notify, RwLock, watch},
    time::Instant,
};
use tracing::debug;

use super::{
    ClientEnvelope, JobId, WorkerEnvelope,
    backend::{EventStream, JobBackend, QueuedJob},
};
use crate::{
    config::JobQueueConfig,
    error::{CoreError, Result},
};

#[derive(Default)]
struct TopicQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    ready: Notify,
}

struct EventLog<T> {
    entries: RwLock<Vec<T>>,
    version: watch::Sender<u64>,
    closed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> EventLog<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            version: watch::Sender::new(0),
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, item: T) {
        self.entries.write().await.push(item);
        self.version.send_modify(|version| *version += 1);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.version.send_modify(|version| *version += 1);
    }

    /// Replays every entry, then follows new ones until the log is closed.
    fn follow(self: Arc<Self>) -> EventStream<T> {
        let log = self;
        Box::pin(stream! {
            let mut version = log.version.subscribe();
            let mut cursor = 0usize;
            loop {
                let batch = {
                    let entries = log.entries.read().await;
                    entries[cursor..].to_vec()
                };
                cursor += batch.len();
                for item in batch {
                    yield Ok::<T, CoreError>(item);
                }
                if log.closed.load(Ordering::Acquire) {
                    break;
                }
                if version.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

struct JobLogs {
    worker: Arc<EventLog<WorkerEnvelope>>,
    client: Arc<EventLog<ClientEnvelope>>,
    touched: std::sync::Mutex<Instant>,
}

impl JobLogs {
    fn new() -> Self {
        Self {
            worker: Arc::new(EventLog::new()),
            client: Arc::new(EventLog::new()),
            touched: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut touched) = self.touched.lock() {
            *touched = Instant::now();
        }
    }

    fn idle_since(&self) -> Option<Instant> {
        self.touched.lock().ok().map(|touched| *touched)
    }

    fn close(&self) {
        self.worker.close();
        self.client.close();
    }
}

#[derive(Clone)]
pub struct InMemoryJobBackend {
    queues: Arc<DashMap<String, Arc<TopicQueue>>>,
    logs: Arc<DashMap<(String, JobId), Arc<JobLogs>>>,
    config: JobQueueConfig,
}

impl fmt::Debug for InMemoryJobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobBackend")
            .field("topics", &self.queues.len())
            .field("jobs", &self.logs.len())
            .field("event_retention", &self.config.event_retention)
            .finish()
    }
}

impl InMemoryJobBackend {
    pub fn new(config: JobQueueConfig) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            logs: Arc::new(DashMap::new()),
            config,
        }
    }

    fn queue(&self, topic: &str) -> Arc<TopicQueue> {
        Arc::clone(
            self.queues
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicQueue::default()))
                .value(),
        )
    }

    fn logs(&self, topic: &str, job_id: JobId) -> Arc<JobLogs> {
        Arc::clone(
            self.logs
                .entry((topic.to_string(), job_id))
                .or_insert_with(|| Arc::new(JobLogs::new()))
                .value(),
        )
    }

    /// Closes and drops event logs not written within the retention window.
    pub fn purge_expired(&self) -> usize {
        let retention = self.config.event_retention;
        let now = Instant::now();
        let mut purged = 0;
        self.logs.retain(|_, logs| {
            let live = logs
                .idle_since()
                .is_some_and(|touched| now.duration_since(touched) < retention);
            if !live {
                logs.close();
                purged += 1;
            }
            live
        });
        if purged > 0 {
            debug!(purged, "expired job event logs");
        }
        purged
    }
}

#[async_trait]
impl JobBackend for InMemoryJobBackend {
    async fn enqueue(&self, topic: &str, job: QueuedJob) -> Result<()> {
        self.purge_expired();
        self.logs(topic, job.job_id).touch();
        let queue = self.queue(topic);
        queue.jobs.lock().await.push_back(job);
        queue.ready.notify_one();
        Ok(())
    }

    fn jobs(&self, topic: &str) -> EventStream<QueuedJob> {
        let queue = self.queue(topic);
        Box::pin(stream! {
            loop {
                let next = {
                    let mut jobs = queue.jobs.lock().await;
                    let next = jobs.pop_front();
                    if next.is_some() && !jobs.is_empty() {
                        // Hand the remainder to another idle consumer.
                        queue.ready.notify_one();
                    }
                    next
                };
                match next {
                    Some(job) => yield Ok::<QueuedJob, CoreError>(job),
                    None => queue.ready.notified().await,
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
        let logs = self.logs(topic, job_id);
        logs.touch();
        logs.worker.push(envelope.clone()).await;
        Ok(())
    }

    fn worker_events(&self, topic: &str, job_id: JobId) -> EventStream<WorkerEnvelope> {
        Arc::clone(&self.logs(topic, job_id).worker).follow()
    }

    async fn push_client_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &ClientEnvelope,
    ) -> Result<()> {
        let logs = self.logs(topic, job_id);
        logs.touch();
        logs.client.push(envelope.clone()).await;
        Ok(())
    }

    fn client_events(&self, topic: &str, job_id: JobId) -> EventStream<ClientEnvelope> {
        Arc::clone(&self.logs(topic, job_id).client).follow()
    }

    async fn delete(&self, topic: &str, job_id: JobId) -> Result<()> {
        if let Some((_, logs)) = self.logs.remove(&(topic.to_string(), job_id)) {
            logs.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::jobs::{ClientEvent, WorkerEvent};

    fn queued(request: &str) -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            request: request.to_string(),
        }
    }

    #[tokio::test]
    async fn each_job_is_dequeued_once() {
        let backend = InMemoryJobBackend::new(JobQueueConfig::default());
        let first = queued("a");
        let second = queued("b");
        backend.enqueue("echo", first.clone()).await.expect("enqueue");
        backend.enqueue("echo", second.clone()).await.expect("enqueue");

        let mut left = backend.jobs("echo");
        let mut right = backend.jobs("echo");
        let a = left.next().await.expect("item").expect("job");
        let b = right.next().await.expect("item").expect("job");
        assert_eq!(a, first);
        assert_eq!(b, second);

        let idle = tokio::time::timeout(Duration::from_millis(20), left.next()).await;
        assert!(idle.is_err(), "queue should be drained");
    }

    #[tokio::test]
    async fn late_reader_replays_history() {
        let backend = InMemoryJobBackend::new(JobQueueConfig::default());
        let job_id = JobId::new();
        for seq in 0..3 {
            let envelope = WorkerEnvelope {
                seq,
                event: WorkerEvent::Event(format!("{seq}")),
            };
            backend
                .push_worker_event("echo", job_id, &envelope)
                .await
                .expect("push");
        }

        let seqs: Vec<u64> = backend
            .worker_events("echo", job_id)
            .take(3)
            .map(|item| item.expect("event").seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reader_follows_live_events_and_ends_on_delete() {
        let backend = InMemoryJobBackend::new(JobQueueConfig::default());
        let job_id = JobId::new();
        let mut events = backend.client_events("echo", job_id);

        let cancel = ClientEnvelope::new(ClientEvent::Cancel);
        backend
            .push_client_event("echo", job_id, &cancel)
            .await
            .expect("push");
        let received = events.next().await.expect("item").expect("event");
        assert_eq!(received, cancel);

        backend.delete("echo", job_id).await.expect("delete");
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_logs_expire_after_retention() {
        let config = JobQueueConfig {
            event_retention: Duration::from_secs(10),
            ..JobQueueConfig::default()
        };
        let backend = InMemoryJobBackend::new(config);
        let job_id = JobId::new();
        let envelope = WorkerEnvelope {
            seq: 0,
            event: WorkerEvent::Success("done".into()),
        };
        backend
            .push_worker_event("echo", job_id, &envelope)
            .await
            .expect("push");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(backend.purge_expired(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(backend.purge_expired(), 1);
    }
}
