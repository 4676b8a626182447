use std::{fmt, marker::PhantomData, sync::Arc};

use async_stream::stream;
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    ClientEnvelope, ClientEvent, JobId, JobTopic, WorkerEnvelope, WorkerEvent,
    backend::{JobBackend, QueuedJob},
};
use crate::{
    config::JobQueueConfig,
    error::{CoreError, Result},
    task::AbortOnDrop,
};

/// Client events buffered for a handler that is not reading them yet.
/// Overflow is dropped; `Cancel` never goes through this buffer.
const CLIENT_EVENT_BUFFER: usize = 64;

/// Worker-side logic for one topic.
///
/// The handler is dropped at its next suspension point when the job is
/// cancelled. Work that must finish regardless belongs in
/// [`crate::task::run_shielded`] or a drop guard.
#[async_trait]
pub trait JobHandler<T: JobTopic>: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext<T>) -> Result<T::Response>;
}

/// Everything a handler gets for a single job.
pub struct JobContext<T: JobTopic> {
    pub job_id: JobId,
    pub request: T::Request,
    /// Decoded `ClientEvent::Event` payloads addressed to this job.
    pub events: mpsc::Receiver<T::ClientEvent>,
    pub emitter: JobEmitter<T>,
    /// Cancelled when a client cancels the job or the worker shuts down.
    pub cancel: CancellationToken,
}

impl<T: JobTopic> fmt::Debug for JobContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("topic", &T::NAME)
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Publishes worker events for one job, numbering them in emission order.
///
/// Clones share one sequence counter. It stays locked until the backend
/// accepted the event, so the log never holds a later number before an
/// earlier one.
pub struct JobEmitter<T: JobTopic> {
    backend: Arc<dyn JobBackend>,
    job_id: JobId,
    next_seq: Arc<Mutex<u64>>,
    _topic: PhantomData<fn() -> T>,
}

impl<T: JobTopic> Clone for JobEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            job_id: self.job_id,
            next_seq: Arc::clone(&self.next_seq),
            _topic: PhantomData,
        }
    }
}

impl<T: JobTopic> fmt::Debug for JobEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEmitter")
            .field("topic", &T::NAME)
            .field("job_id", &self.job_id)
            .field("next_seq", &self.next_seq.try_lock().map(|seq| *seq).ok())
            .finish()
    }
}

impl<T: JobTopic> JobEmitter<T> {
    fn new(backend: Arc<dyn JobBackend>, job_id: JobId) -> Self {
        Self {
            backend,
            job_id,
            next_seq: Arc::new(Mutex::new(0)),
            _topic: PhantomData,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Publishes a progress event to every monitor of the job.
    pub async fn emit(&self, event: &T::WorkerEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.publish(WorkerEvent::Event(payload)).await
    }

    async fn publish(&self, event: WorkerEvent<String, String>) -> Result<()> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        // A failed push may still have reached some nodes; never reuse its number.
        *next_seq += 1;
        self.backend
            .push_worker_event(T::NAME, self.job_id, &WorkerEnvelope { seq, event })
            .await
    }
}

/// Typed view of one topic on a shared [`JobBackend`].
pub struct JobQueue<T: JobTopic> {
    backend: Arc<dyn JobBackend>,
    config: JobQueueConfig,
    _topic: PhantomData<fn() -> T>,
}

impl<T: JobTopic> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config,
            _topic: PhantomData,
        }
    }
}

impl<T: JobTopic> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("topic", &T::NAME)
            .field("backend", &self.backend)
            .finish()
    }
}

impl<T: JobTopic> JobQueue<T> {
    pub fn new(backend: Arc<dyn JobBackend>, config: JobQueueConfig) -> Self {
        Self {
            backend,
            config,
            _topic: PhantomData,
        }
    }

    pub fn topic(&self) -> &'static str {
        T::NAME
    }

    /// Queues `request` for exactly one worker.
    pub async fn submit(&self, request: &T::Request) -> Result<JobId> {
        let job_id = JobId::new();
        let job = QueuedJob {
            job_id,
            request: serde_json::to_string(request)?,
        };
        self.backend.enqueue(T::NAME, job).await?;
        debug!(topic = T::NAME, job = %job_id, "job submitted");
        Ok(job_id)
    }

    /// Every worker event of `job_id`, past ones first. The stream ends
    /// after the terminal event. Monitors of unknown jobs wait forever.
    pub fn monitor(
        &self,
        job_id: JobId,
    ) -> BoxStream<'static, Result<WorkerEvent<T::WorkerEvent, T::Response>>> {
        let events = self.backend.worker_events(T::NAME, job_id);
        Box::pin(stream! {
            let mut events = events;
            while let Some(item) = events.next().await {
                let envelope = match item {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        yield Err(err);
                        continue;
                    }
                };
                match decode_worker_event::<T>(envelope.event) {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        yield Ok(event);
                        if terminal {
                            break;
                        }
                    }
                    Err(err) => yield Err(err),
                }
            }
        })
    }

    /// Asks the worker to stop. Idempotent; a finished job ignores it.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.push_client_event(job_id, ClientEvent::Cancel).await
    }

    pub async fn notify(&self, job_id: JobId, event: &T::ClientEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.push_client_event(job_id, ClientEvent::Event(payload))
            .await
    }

    /// Drops the job's event logs. Idempotent.
    pub async fn delete(&self, job_id: JobId) -> Result<()> {
        self.backend.delete(T::NAME, job_id).await
    }

    async fn push_client_event(&self, job_id: JobId, event: ClientEvent<String>) -> Result<()> {
        self.backend
            .push_client_event(T::NAME, job_id, &ClientEnvelope::new(event))
            .await
    }

    /// Starts a dispatch loop running `handler` for every job of this topic.
    pub fn register<H: JobHandler<T>>(&self, handler: H) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop::<T, H>(
            Arc::clone(&self.backend),
            self.config,
            Arc::new(handler),
            shutdown.clone(),
        ));
        WorkerHandle {
            topic: T::NAME,
            shutdown,
            task,
        }
    }
}

fn decode_worker_event<T: JobTopic>(
    event: WorkerEvent<String, String>,
) -> Result<WorkerEvent<T::WorkerEvent, T::Response>> {
    Ok(match event {
        WorkerEvent::Event(payload) => WorkerEvent::Event(serde_json::from_str(&payload)?),
        WorkerEvent::Success(payload) => WorkerEvent::Success(serde_json::from_str(&payload)?),
        WorkerEvent::Fail(reason) => WorkerEvent::Fail(reason),
    })
}

/// Owner of a registered dispatch loop.
#[derive(Debug)]
pub struct WorkerHandle {
    topic: &'static str,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops taking jobs, cancels running ones and waits for them to unwind.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!(topic = self.topic, "job worker terminated abnormally: {err}");
        }
    }
}

async fn dispatch_loop<T, H>(
    backend: Arc<dyn JobBackend>,
    config: JobQueueConfig,
    handler: Arc<H>,
    shutdown: CancellationToken,
) where
    T: JobTopic,
    H: JobHandler<T>,
{
    let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
    let mut jobs = backend.jobs(T::NAME);
    let mut running = JoinSet::new();
    info!(
        topic = T::NAME,
        max_concurrent = config.max_concurrent_jobs,
        "job worker started"
    );

    loop {
        // Only dequeue once a slot is free so queued jobs stay available to
        // other workers meanwhile.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = jobs.next() => next,
        };

        match next {
            Some(Ok(job)) => {
                let backend = Arc::clone(&backend);
                let handler = Arc::clone(&handler);
                let cancel = shutdown.child_token();
                running.spawn(async move {
                    run_job::<T, H>(backend, handler, job, cancel).await;
                    drop(permit);
                });
            }
            Some(Err(err)) => {
                warn!(topic = T::NAME, error = %err, "failed to dequeue job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
            None => {
                warn!(topic = T::NAME, "job dispatch stream ended");
                break;
            }
        }

        while let Some(finished) = running.try_join_next() {
            if let Err(err) = finished {
                error!(topic = T::NAME, "job task panicked: {err}");
            }
        }
    }

    shutdown.cancel();
    while let Some(finished) = running.join_next().await {
        if let Err(err) = finished {
            error!(topic = T::NAME, "job task panicked: {err}");
        }
    }
    info!(topic = T::NAME, "job worker stopped");
}

async fn run_job<T, H>(
    backend: Arc<dyn JobBackend>,
    handler: Arc<H>,
    job: QueuedJob,
    cancel: CancellationToken,
) where
    T: JobTopic,
    H: JobHandler<T>,
{
    let job_id = job.job_id;
    let span = info_span!(target: "jobs::dispatch", "job", topic = T::NAME, job = %job_id);

    async move {
        let emitter = JobEmitter::<T>::new(Arc::clone(&backend), job_id);

        let request: T::Request = match serde_json::from_str(&job.request) {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "jobs::dispatch", error = %err, "undecodable job request");
                let reason = format!("invalid request: {err}");
                if let Err(err) = emitter.publish(WorkerEvent::Fail(reason)).await {
                    error!(target: "jobs::dispatch", error = %err, "failed to publish failure");
                }
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::channel(CLIENT_EVENT_BUFFER);
        let _listener = AbortOnDrop::new(tokio::spawn(
            listen_client_events::<T>(Arc::clone(&backend), job_id, events_tx, cancel.clone())
                .in_current_span(),
        ));

        debug!(target: "jobs::dispatch", "job started");
        let ctx = JobContext {
            job_id,
            request,
            events: events_rx,
            emitter: emitter.clone(),
            cancel: cancel.clone(),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handler.handle(ctx) => Some(result),
        };

        let terminal = match outcome {
            None => {
                info!(target: "jobs::dispatch", "job cancelled");
                None
            }
            Some(Err(err)) if err.is_cancelled() => {
                info!(target: "jobs::dispatch", "job cancelled: {err}");
                None
            }
            Some(Err(err)) => {
                warn!(target: "jobs::dispatch", error = %err, "job failed");
                Some(WorkerEvent::Fail(err.to_string()))
            }
            Some(Ok(response)) => match serde_json::to_string(&response) {
                Ok(payload) => {
                    debug!(target: "jobs::dispatch", "job succeeded");
                    Some(WorkerEvent::Success(payload))
                }
                Err(err) => Some(WorkerEvent::Fail(
                    CoreError::from(err).to_string(),
                )),
            },
        };

        if let Some(event) = terminal
            && let Err(err) = emitter.publish(event).await
        {
            error!(target: "jobs::dispatch", error = %err, "failed to publish terminal event");
        }
    }
    .instrument(span)
    .await
}

/// Forwards client events of one job to its handler until `Cancel` arrives.
async fn listen_client_events<T: JobTopic>(
    backend: Arc<dyn JobBackend>,
    job_id: JobId,
    events: mpsc::Sender<T::ClientEvent>,
    cancel: CancellationToken,
) {
    let mut stream = backend.client_events(T::NAME, job_id);
    while let Some(item) = stream.next().await {
        let envelope = match item {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "jobs::dispatch", error = %err, "client event read failed");
                continue;
            }
        };
        match envelope.event {
            ClientEvent::Cancel => {
                debug!(target: "jobs::dispatch", "cancel requested");
                cancel.cancel();
                break;
            }
            ClientEvent::Event(payload) => {
                match serde_json::from_str::<T::ClientEvent>(&payload) {
                    Ok(event) => {
                        if let Err(err) = events.try_send(event) {
                            debug!(target: "jobs::dispatch", "client event dropped: {err}");
                        }
                    }
                    Err(err) => {
                        warn!(target: "jobs::dispatch", error = %err, "undecodable client event");
                    }
                }
            }
            ClientEvent::NoOp => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::jobs::InMemoryJobBackend;

    struct Echo;

    impl JobTopic for Echo {
        const NAME: &'static str = "echo";
        type Request = String;
        type Response = String;
        type ClientEvent = Ping;
        type WorkerEvent = u32;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler<Echo> for EchoHandler {
        async fn handle(&self, ctx: JobContext<Echo>) -> Result<String> {
            ctx.emitter.emit(&1).await?;
            Ok(ctx.request)
        }
    }

    /// Waits for pings; returns after the third.
    struct PingCounter;

    #[async_trait]
    impl JobHandler<Echo> for PingCounter {
        async fn handle(&self, mut ctx: JobContext<Echo>) -> Result<String> {
            let mut seen = 0;
            while ctx.events.recv().await.is_some() {
                seen += 1;
                ctx.emitter.emit(&seen).await?;
                if seen == 3 {
                    return Ok("three".into());
                }
            }
            Err(CoreError::Cancelled("client gone".into()))
        }
    }

    fn queue() -> JobQueue<Echo> {
        let backend = Arc::new(InMemoryJobBackend::new(JobQueueConfig::default()));
        JobQueue::new(backend, JobQueueConfig::default())
    }

    #[tokio::test]
    async fn echo_job_succeeds_once() {
        let queue = queue();
        let worker = queue.register(EchoHandler);

        let job_id = queue.submit(&"hello".to_string()).await.expect("submit");
        let events: Vec<_> = queue
            .monitor(job_id)
            .map(|item| item.expect("event"))
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                WorkerEvent::Event(1),
                WorkerEvent::Success("hello".to_string())
            ]
        );
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn late_monitor_replays_terminal_event() {
        let queue = queue();
        let worker = queue.register(EchoHandler);
        let job_id = queue.submit(&"late".to_string()).await.expect("submit");

        let mut first = queue.monitor(job_id);
        while let Some(event) = first.next().await {
            event.expect("event");
        }

        let replay: Vec<_> = queue
            .monitor(job_id)
            .map(|item| item.expect("event"))
            .collect()
            .await;
        assert_eq!(replay.last(), Some(&WorkerEvent::Success("late".into())));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn notify_reaches_running_handler() {
        let queue = queue();
        let worker = queue.register(PingCounter);
        let job_id = queue.submit(&String::new()).await.expect("submit");

        for _ in 0..3 {
            queue.notify(job_id, &Ping).await.expect("notify");
        }

        let events: Vec<_> = queue
            .monitor(job_id)
            .map(|item| item.expect("event"))
            .collect()
            .await;
        assert_eq!(events.last(), Some(&WorkerEvent::Success("three".into())));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_job_publishes_no_terminal_event() {
        let queue = queue();
        let worker = queue.register(PingCounter);
        let job_id = queue.submit(&String::new()).await.expect("submit");

        queue.notify(job_id, &Ping).await.expect("notify");
        let mut monitor = queue.monitor(job_id);
        assert_eq!(
            monitor.next().await.expect("item").expect("event"),
            WorkerEvent::Event(1)
        );

        queue.cancel(job_id).await.expect("cancel");
        let after = tokio::time::timeout(Duration::from_millis(100), monitor.next()).await;
        assert!(after.is_err(), "cancelled jobs end silently");

        // The worker slot is free again.
        let next = queue.submit(&String::new()).await.expect("submit");
        for _ in 0..3 {
            queue.notify(next, &Ping).await.expect("notify");
        }
        let events: Vec<_> = queue
            .monitor(next)
            .map(|item| item.expect("event"))
            .collect()
            .await;
        assert_eq!(events.last(), Some(&WorkerEvent::Success("three".into())));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_request_fails_the_job() {
        let backend: Arc<dyn JobBackend> =
            Arc::new(InMemoryJobBackend::new(JobQueueConfig::default()));
        let queue: JobQueue<Echo> = JobQueue::new(Arc::clone(&backend), JobQueueConfig::default());
        let worker = queue.register(EchoHandler);

        let job_id = JobId::new();
        backend
            .enqueue(
                Echo::NAME,
                QueuedJob {
                    job_id,
                    request: "{not json".into(),
                },
            )
            .await
            .expect("enqueue");

        let events: Vec<_> = queue
            .monitor(job_id)
            .map(|item| item.expect("event"))
            .collect()
            .await;
        assert!(matches!(events.as_slice(), [WorkerEvent::Fail(reason)] if reason.starts_with("invalid request")));
        worker.shutdown().await;
    }
}
