use std::{collections::HashMap, fmt, sync::Arc};

use tokio::sync::Mutex;
use tracing::info;

use super::{JobBackend, JobHandler, JobQueue, JobTopic, WorkerHandle};
use crate::config::JobQueueConfig;

/// Owns the job backend of a process and the dispatch loops registered on
/// it, keyed by topic name.
pub struct JobQueueRegistry {
    backend: Arc<dyn JobBackend>,
    config: JobQueueConfig,
    workers: Mutex<HashMap<&'static str, Vec<WorkerHandle>>>,
}

impl fmt::Debug for JobQueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self
            .workers
            .try_lock()
            .map(|workers| workers.values().map(Vec::len).sum::<usize>())
            .ok();
        f.debug_struct("JobQueueRegistry")
            .field("backend", &self.backend)
            .field("workers", &workers)
            .finish()
    }
}

impl JobQueueRegistry {
    pub fn new(backend: Arc<dyn JobBackend>, config: JobQueueConfig) -> Self {
        Self {
            backend,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn JobBackend> {
        Arc::clone(&self.backend)
    }

    pub fn queue<T: JobTopic>(&self) -> JobQueue<T> {
        JobQueue::new(Arc::clone(&self.backend), self.config)
    }

    /// Registers `handler` for `T` and keeps its dispatch loop alive until
    /// [`JobQueueRegistry::shutdown`].
    pub async fn register<T, H>(&self, handler: H)
    where
        T: JobTopic,
        H: JobHandler<T>,
    {
        let handle = self.queue::<T>().register(handler);
        let mut workers = self.workers.lock().await;
        let topic = workers.entry(T::NAME).or_default();
        topic.push(handle);
        info!(topic = T::NAME, workers = topic.len(), "job handler registered");
    }

    /// Number of live dispatch loops for `topic`.
    pub async fn worker_count(&self, topic: &str) -> usize {
        self.workers
            .lock()
            .await
            .get(topic)
            .map(|handles| handles.iter().filter(|handle| !handle.is_finished()).count())
            .unwrap_or(0)
    }

    /// Stops every registered dispatch loop and waits for running jobs to
    /// unwind.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for (topic, handles) in workers {
            info!(topic, count = handles.len(), "stopping job workers");
            futures::future::join_all(handles.into_iter().map(WorkerHandle::shutdown)).await;
        }
    }
}
