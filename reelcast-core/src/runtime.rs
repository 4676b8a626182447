use std::{fmt, sync::Arc};

use tracing::info;

use crate::{
    cache::{self, Cache},
    config::CoreConfig,
    error::Result,
    jobs::{self, JobBackend, JobQueueRegistry},
    lock::DistributedLock,
    stream::{
        StreamJobHandler, StreamService, SubtitleExtractor, SubtitleJobHandler, SubtitleTopic,
        TranscodePipeline, TranscodeTopic,
    },
};

/// The coordination core of one process: cache, locks and job registry
/// built from a single [`CoreConfig`], constructed once at startup and
/// handed to every component that needs it.
#[derive(Clone)]
pub struct Runtime {
    cache: Arc<dyn Cache>,
    locks: DistributedLock,
    jobs: Arc<JobQueueRegistry>,
    config: CoreConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("cache", &self.cache)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Connects the backend tier selected by `config.cache`.
    pub async fn connect(config: CoreConfig) -> Result<Self> {
        let cache = cache::connect(&config.cache, &config.lock).await?;
        let backend = jobs::connect(&config.cache, &config.jobs, Arc::clone(&cache)).await?;
        info!(
            nodes = config.cache.node_count(),
            "coordination runtime connected"
        );
        Ok(Self::from_parts(cache, backend, config))
    }

    /// Assembles a runtime from already built backends.
    pub fn from_parts(
        cache: Arc<dyn Cache>,
        backend: Arc<dyn JobBackend>,
        config: CoreConfig,
    ) -> Self {
        Self {
            locks: DistributedLock::new(Arc::clone(&cache), config.lock),
            jobs: Arc::new(JobQueueRegistry::new(backend, config.jobs)),
            cache,
            config,
        }
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    pub fn locks(&self) -> &DistributedLock {
        &self.locks
    }

    pub fn jobs(&self) -> &JobQueueRegistry {
        &self.jobs
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn stream_service(&self) -> StreamService {
        StreamService::new(
            Arc::clone(&self.cache),
            self.locks.clone(),
            self.jobs.queue::<TranscodeTopic>(),
            self.config.stream,
        )
    }

    /// Makes this process a stream worker: registers the transcode and
    /// subtitle handlers on the shared registry.
    pub async fn register_stream_workers(
        &self,
        pipeline: Arc<dyn TranscodePipeline>,
        extractor: Arc<dyn SubtitleExtractor>,
    ) {
        let transcode = StreamJobHandler::new(
            Arc::clone(&self.cache),
            pipeline,
            self.jobs.queue::<SubtitleTopic>(),
            self.config.stream,
        );
        self.jobs.register::<TranscodeTopic, _>(transcode).await;
        self.jobs
            .register::<SubtitleTopic, _>(SubtitleJobHandler::new(extractor))
            .await;
    }

    /// Stops every registered worker and waits for running jobs to unwind.
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
    }
}
