//! Job backend replicated over independent nodes.
//!
//! Writes go to every node and succeed once a strict majority accepted them.
//! Because each node holds its own copy of a queued job, a dequeued copy only
//! runs after it wins the claim key on the quorum cache; the other copies are
//! dropped when they surface. Readers merge every node's log: worker events
//! are delivered in strictly increasing `seq` order, client events once per
//! envelope id. A reader may skip a worker event that only lagging nodes hold,
//! but never reorders them.

use std::{collections::HashSet, fmt, future::Future, sync::Arc, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::{StreamExt, future::join_all, stream::select_all};
use tracing::{debug, warn};

use super::{
    ClientEnvelope, JobId, WorkerEnvelope,
    backend::{EventStream, JobBackend, QueuedJob},
};
use crate::{
    cache::{
        Cache, CacheKeys,
        cluster::{quorum, quorum_reached},
    },
    config::JobQueueConfig,
    error::{CoreError, Result},
    lock::LeaseId,
};

#[derive(Clone)]
pub struct ClusterJobBackend {
    nodes: Arc<Vec<Arc<dyn JobBackend>>>,
    claims: Arc<dyn Cache>,
    config: JobQueueConfig,
    node_timeout: Duration,
}

impl fmt::Debug for ClusterJobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterJobBackend")
            .field("nodes", &self.nodes.len())
            .field("quorum", &quorum(self.nodes.len()))
            .field("claims", &self.claims)
            .finish()
    }
}

impl ClusterJobBackend {
    pub fn new(
        nodes: Vec<Arc<dyn JobBackend>>,
        claims: Arc<dyn Cache>,
        config: JobQueueConfig,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CoreError::Invalid(
                "cluster job backend needs at least one node".into(),
            ));
        }
        Ok(Self {
            nodes: Arc::new(nodes),
            claims,
            config,
            node_timeout: Duration::from_millis(500),
        })
    }

    /// Caps how long a single node write may take before it counts as failed.
    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    async fn replicate<'a, F, Fut>(&'a self, operation: &'static str, op: F) -> Result<()>
    where
        F: Fn(&'a Arc<dyn JobBackend>) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        let timeout = self.node_timeout;
        let results = join_all(self.nodes.iter().map(|node| {
            let call = op(node);
            async move {
                tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                    Err(CoreError::Unavailable(format!(
                        "job node did not answer within {timeout:?}"
                    )))
                })
            }
        }))
        .await;

        let total = results.len();
        let mut successes = 0;
        for result in results {
            match result {
                Ok(()) => successes += 1,
                Err(err) => debug!(operation, error = %err, "job node write failed"),
            }
        }
        if quorum_reached(successes, total) {
            Ok(())
        } else {
            warn!(operation, successes, nodes = total, "job quorum not reached");
            Err(CoreError::Quorum {
                operation,
                successes,
                required: quorum(total),
            })
        }
    }
}

#[async_trait]
impl JobBackend for ClusterJobBackend {
    async fn enqueue(&self, topic: &str, job: QueuedJob) -> Result<()> {
        let job = &job;
        self.replicate("enqueue", |node| node.enqueue(topic, job.clone()))
            .await
    }

    fn jobs(&self, topic: &str) -> EventStream<QueuedJob> {
        let merged = select_all(self.nodes.iter().map(|node| node.jobs(topic)));
        let claims = Arc::clone(&self.claims);
        let retention = self.config.event_retention;
        let topic = topic.to_string();
        Box::pin(stream! {
            let mut merged = merged;
            while let Some(item) = merged.next().await {
                let job = match item {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(topic = %topic, error = %err, "job node dequeue failed");
                        continue;
                    }
                };
                let claim = CacheKeys::job_claim(&topic, job.job_id);
                match claims.set_if_absent(&claim, LeaseId::new().to_bytes(), retention).await {
                    Ok(true) => yield Ok(job),
                    Ok(false) => {
                        debug!(topic = %topic, job = %job.job_id, "replica already claimed");
                    }
                    Err(err) => yield Err(err),
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
        self.replicate("push_worker_event", |node| {
            node.push_worker_event(topic, job_id, envelope)
        })
        .await
    }

    fn worker_events(&self, topic: &str, job_id: JobId) -> EventStream<WorkerEnvelope> {
        let merged = select_all(
            self.nodes
                .iter()
                .map(|node| node.worker_events(topic, job_id)),
        );
        Box::pin(stream! {
            let mut merged = merged;
            let mut delivered: Option<u64> = None;
            while let Some(item) = merged.next().await {
                match item {
                    Ok(envelope) => {
                        if delivered.is_some_and(|seq| envelope.seq <= seq) {
                            continue;
                        }
                        delivered = Some(envelope.seq);
                        yield Ok::<WorkerEnvelope, CoreError>(envelope);
                    }
                    Err(err) => debug!(job = %job_id, error = %err, "job node read failed"),
                }
            }
        })
    }

    async fn push_client_event(
        &self,
        topic: &str,
        job_id: JobId,
        envelope: &ClientEnvelope,
    ) -> Result<()> {
        self.replicate("push_client_event", |node| {
            node.push_client_event(topic, job_id, envelope)
        })
        .await
    }

    fn client_events(&self, topic: &str, job_id: JobId) -> EventStream<ClientEnvelope> {
        let merged = select_all(
            self.nodes
                .iter()
                .map(|node| node.client_events(topic, job_id)),
        );
        Box::pin(stream! {
            let mut merged = merged;
            let mut seen = HashSet::new();
            while let Some(item) = merged.next().await {
                match item {
                    Ok(envelope) => {
                        if seen.insert(envelope.id) {
                            yield Ok::<ClientEnvelope, CoreError>(envelope);
                        }
                    }
                    Err(err) => debug!(job = %job_id, error = %err, "job node read failed"),
                }
            }
        })
    }

    async fn delete(&self, topic: &str, job_id: JobId) -> Result<()> {
        self.replicate("delete", |node| node.delete(topic, job_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::{
        cache::{ClusterCache, InMemoryCache},
        jobs::{
            ClientEvent, InMemoryJobBackend, JobContext, JobHandler, JobQueue, JobTopic,
            WorkerEvent,
        },
    };

    #[derive(Debug)]
    struct DownNode;

    #[async_trait]
    impl JobBackend for DownNode {
        async fn enqueue(&self, _topic: &str, _job: QueuedJob) -> Result<()> {
            Err(CoreError::Unavailable("node down".into()))
        }

        fn jobs(&self, _topic: &str) -> EventStream<QueuedJob> {
            Box::pin(stream::pending())
        }

        async fn push_worker_event(
            &self,
            _topic: &str,
            _job_id: JobId,
            _envelope: &WorkerEnvelope,
        ) -> Result<()> {
            Err(CoreError::Unavailable("node down".into()))
        }

        fn worker_events(&self, _topic: &str, _job_id: JobId) -> EventStream<WorkerEnvelope> {
            Box::pin(stream::pending())
        }

        async fn push_client_event(
            &self,
            _topic: &str,
            _job_id: JobId,
            _envelope: &ClientEnvelope,
        ) -> Result<()> {
            Err(CoreError::Unavailable("node down".into()))
        }

        fn client_events(&self, _topic: &str, _job_id: JobId) -> EventStream<ClientEnvelope> {
            Box::pin(stream::pending())
        }

        async fn delete(&self, _topic: &str, _job_id: JobId) -> Result<()> {
            Err(CoreError::Unavailable("node down".into()))
        }
    }

    /// Healthy node whose write of the first worker event is slow.
    #[derive(Debug)]
    struct SlowFirstEvent(InMemoryJobBackend);

    #[async_trait]
    impl JobBackend for SlowFirstEvent {
        async fn enqueue(&self, topic: &str, job: QueuedJob) -> Result<()> {
            self.0.enqueue(topic, job).await
        }

        fn jobs(&self, topic: &str) -> EventStream<QueuedJob> {
            self.0.jobs(topic)
        }

        async fn push_worker_event(
            &self,
            topic: &str,
            job_id: JobId,
            envelope: &WorkerEnvelope,
        ) -> Result<()> {
            if envelope.seq == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.0.push_worker_event(topic, job_id, envelope).await
        }

        fn worker_events(&self, topic: &str, job_id: JobId) -> EventStream<WorkerEnvelope> {
            self.0.worker_events(topic, job_id)
        }

        async fn push_client_event(
            &self,
            topic: &str,
            job_id: JobId,
            envelope: &ClientEnvelope,
        ) -> Result<()> {
            self.0.push_client_event(topic, job_id, envelope).await
        }

        fn client_events(&self, topic: &str, job_id: JobId) -> EventStream<ClientEnvelope> {
            self.0.client_events(topic, job_id)
        }

        async fn delete(&self, topic: &str, job_id: JobId) -> Result<()> {
            self.0.delete(topic, job_id).await
        }
    }

    struct Burst;

    impl JobTopic for Burst {
        const NAME: &'static str = "burst";
        type Request = ();
        type Response = ();
        type ClientEvent = ();
        type WorkerEvent = u32;
    }

    /// Emits from a cloned emitter on another task, then from its own.
    struct BurstHandler;

    #[async_trait]
    impl JobHandler<Burst> for BurstHandler {
        async fn handle(&self, ctx: JobContext<Burst>) -> Result<()> {
            let early = ctx.emitter.clone();
            let early = tokio::spawn(async move { early.emit(&100).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.emitter.emit(&200).await?;
            early
                .await
                .map_err(|err| CoreError::Internal(err.to_string()))??;
            Ok(())
        }
    }

    fn cluster(healthy: usize, down: usize) -> ClusterJobBackend {
        let config = JobQueueConfig::default();
        let mut nodes: Vec<Arc<dyn JobBackend>> = Vec::new();
        let mut caches: Vec<Arc<dyn Cache>> = Vec::new();
        for _ in 0..healthy {
            nodes.push(Arc::new(InMemoryJobBackend::new(config)));
            caches.push(Arc::new(InMemoryCache::new()));
        }
        for _ in 0..down {
            nodes.push(Arc::new(DownNode));
        }
        let claims = ClusterCache::new(caches, 0.01).expect("claims cache");
        ClusterJobBackend::new(nodes, Arc::new(claims), config).expect("cluster")
    }

    fn queued() -> QueuedJob {
        QueuedJob {
            job_id: JobId::new(),
            request: "\"hello\"".into(),
        }
    }

    #[tokio::test]
    async fn replicated_job_runs_once() {
        let backend = cluster(3, 0);
        let job = queued();
        backend.enqueue("echo", job.clone()).await.expect("enqueue");

        let mut jobs = backend.jobs("echo");
        let first = jobs.next().await.expect("item").expect("job");
        assert_eq!(first, job);

        let again = tokio::time::timeout(Duration::from_millis(50), jobs.next()).await;
        assert!(again.is_err(), "replica copies must not be handed out");
    }

    #[tokio::test]
    async fn writes_need_a_majority() {
        let tolerant = cluster(3, 2);
        tolerant.enqueue("echo", queued()).await.expect("3 of 5 accept");

        let broken = cluster(2, 3);
        let err = broken
            .enqueue("echo", queued())
            .await
            .expect_err("2 of 5 is not a majority");
        assert!(matches!(err, CoreError::Quorum { successes: 2, required: 3, .. }));
    }

    #[tokio::test]
    async fn readers_see_each_event_once_in_order() {
        let backend = cluster(3, 0);
        let job_id = JobId::new();
        for seq in 0..3 {
            let envelope = WorkerEnvelope {
                seq,
                event: WorkerEvent::Event(seq.to_string()),
            };
            backend
                .push_worker_event("echo", job_id, &envelope)
                .await
                .expect("push");
        }
        let cancel = ClientEnvelope::new(ClientEvent::Cancel);
        backend
            .push_client_event("echo", job_id, &cancel)
            .await
            .expect("push");

        let mut events = backend.worker_events("echo", job_id);
        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(events.next().await.expect("item").expect("event").seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        let extra = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(extra.is_err(), "duplicates must be dropped");

        let mut client = backend.client_events("echo", job_id);
        assert_eq!(client.next().await.expect("item").expect("event"), cancel);
        let extra = tokio::time::timeout(Duration::from_millis(50), client.next()).await;
        assert!(extra.is_err(), "duplicates must be dropped");
    }

    #[tokio::test]
    async fn concurrent_emitters_keep_every_event() {
        let config = JobQueueConfig::default();
        let mut nodes: Vec<Arc<dyn JobBackend>> = Vec::new();
        let mut caches: Vec<Arc<dyn Cache>> = Vec::new();
        for _ in 0..3 {
            nodes.push(Arc::new(SlowFirstEvent(InMemoryJobBackend::new(config))));
            caches.push(Arc::new(InMemoryCache::new()));
        }
        let claims = ClusterCache::new(caches, 0.01).expect("claims cache");
        let backend: Arc<dyn JobBackend> =
            Arc::new(ClusterJobBackend::new(nodes, Arc::new(claims), config).expect("cluster"));

        let queue: JobQueue<Burst> = JobQueue::new(backend, config);
        let worker = queue.register(BurstHandler);
        let job_id = queue.submit(&()).await.expect("submit");

        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(5),
            queue.monitor(job_id).map(|item| item.expect("event")).collect::<Vec<_>>(),
        )
        .await
        .expect("monitor finished");
        assert_eq!(
            events,
            vec![
                WorkerEvent::Event(100),
                WorkerEvent::Event(200),
                WorkerEvent::Success(())
            ]
        );
        worker.shutdown().await;
    }
}
