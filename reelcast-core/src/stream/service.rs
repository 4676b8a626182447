use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use super::{
    artifacts::StreamArtifacts,
    model::{
        CreateStream, SessionStreamEntry, StreamHandle, StreamId, StreamMetadata, StreamStatus,
        TranscodeClientEvent, TranscodeRequest, TranscodeTopic,
    },
};
use crate::{
    cache::{Cache, CacheExt, CacheKeys, expire_in},
    config::StreamConfig,
    error::{CoreError, Result},
    jobs::JobQueue,
    lock::DistributedLock,
    task::run_shielded,
};

/// Consumer side of stream sessions: creation, heartbeats and deletion, plus
/// artifact reads for the HTTP layer.
#[derive(Clone)]
pub struct StreamService {
    cache: Arc<dyn Cache>,
    locks: DistributedLock,
    transcodes: JobQueue<TranscodeTopic>,
    config: StreamConfig,
}

impl fmt::Debug for StreamService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamService")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn session_lock(session_id: &str) -> String {
    format!("StreamSession:{session_id}")
}

impl StreamService {
    pub fn new(
        cache: Arc<dyn Cache>,
        locks: DistributedLock,
        transcodes: JobQueue<TranscodeTopic>,
        config: StreamConfig,
    ) -> Self {
        Self {
            cache,
            locks,
            transcodes,
            config,
        }
    }

    fn artifacts(&self, stream_id: StreamId) -> StreamArtifacts {
        StreamArtifacts::new(Arc::clone(&self.cache), stream_id)
    }

    pub async fn session_stream(&self, session_id: &str) -> Result<Option<SessionStreamEntry>> {
        self.cache
            .get_json(&CacheKeys::session_stream(session_id))
            .await
    }

    /// Starts a stream for `request.session_id`, replacing any stream the
    /// session already has. Serialized per session by a lease lock.
    pub async fn create_stream(&self, request: CreateStream) -> Result<StreamHandle> {
        let lock = self
            .locks
            .acquire(
                &session_lock(&request.session_id),
                self.config.lock_timeout,
                self.config.lock_wait,
            )
            .await?;

        self.locks
            .with_lock(lock, async {
                self.teardown_session(&request.session_id).await?;

                let stream_id = StreamId::new();
                self.artifacts(stream_id)
                    .write_placeholder(expire_in(self.config.placeholder_ttl))
                    .await?;

                let job_id = self
                    .transcodes
                    .submit(&TranscodeRequest {
                        stream_id,
                        session_id: request.session_id.clone(),
                        source: request.source.clone(),
                        subtitle_track: request.subtitle_track,
                        start_offset: request.start_offset,
                    })
                    .await?;

                let entry = SessionStreamEntry { stream_id, job_id };
                self.cache
                    .put_json(
                        &CacheKeys::session_stream(&request.session_id),
                        &entry,
                        expire_in(self.config.session_ttl),
                    )
                    .await?;

                info!(
                    session = %request.session_id,
                    stream = %stream_id,
                    job = %job_id,
                    "stream created"
                );
                Ok(StreamHandle { stream_id, job_id })
            })
            .await
    }

    /// Renews every artifact of the session's stream and reports its status.
    ///
    /// If any artifact vanished the job is cancelled and `Canceled` is
    /// returned; otherwise the job receives a liveness event.
    pub async fn heartbeat(&self, session_id: &str) -> Result<StreamStatus> {
        let session_key = CacheKeys::session_stream(session_id);
        let Some(entry) = self.cache.get_json::<SessionStreamEntry>(&session_key).await? else {
            debug!(target: "stream::heartbeat", session = %session_id, "no stream for session");
            return Ok(StreamStatus::Canceled);
        };

        let artifacts = self.artifacts(entry.stream_id);
        let metadata = artifacts.metadata().await?;
        artifacts
            .extend_all(
                metadata.as_ref(),
                &session_key,
                expire_in(self.config.artifact_ttl),
            )
            .await?;

        if !artifacts.all_exist(metadata.as_ref(), &session_key).await? {
            warn!(
                target: "stream::heartbeat",
                session = %session_id,
                stream = %entry.stream_id,
                job = %entry.job_id,
                "stream artifact missing, cancelling job"
            );
            self.transcodes.cancel(entry.job_id).await?;
            return Ok(StreamStatus::Canceled);
        }

        self.transcodes
            .notify(entry.job_id, &TranscodeClientEvent::Heartbeat)
            .await?;

        let status = match metadata {
            Some(metadata) if metadata.is_available() => StreamStatus::Available,
            _ => StreamStatus::Pending,
        };
        debug!(target: "stream::heartbeat", session = %session_id, ?status, "heartbeat");
        Ok(status)
    }

    /// Stops the session's stream and deletes all of its artifacts.
    /// Idempotent.
    pub async fn delete_stream(&self, session_id: &str) -> Result<()> {
        let lock = self
            .locks
            .acquire(
                &session_lock(session_id),
                self.config.lock_timeout,
                self.config.lock_wait,
            )
            .await?;
        self.locks
            .with_lock(lock, self.teardown_session(session_id))
            .await
    }

    /// Cancels the session's job and removes its artifacts and mapping.
    /// Runs shielded so a dropped caller cannot leave artifacts behind.
    async fn teardown_session(&self, session_id: &str) -> Result<()> {
        let session_key = CacheKeys::session_stream(session_id);
        let Some(entry) = self.cache.get_json::<SessionStreamEntry>(&session_key).await? else {
            return Ok(());
        };

        let transcodes = self.transcodes.clone();
        let cache = Arc::clone(&self.cache);
        let artifacts = self.artifacts(entry.stream_id);
        run_shielded(async move {
            transcodes.cancel(entry.job_id).await?;
            let segment_count = artifacts
                .metadata()
                .await?
                .as_ref()
                .map_or(0, StreamMetadata::segment_count);
            artifacts.delete_all(segment_count).await?;
            cache.del(&session_key).await?;
            info!(stream = %entry.stream_id, job = %entry.job_id, segment_count, "stream deleted");
            Ok::<_, CoreError>(())
        })
        .await?
    }

    pub async fn metadata(&self, stream_id: StreamId) -> Result<Option<StreamMetadata>> {
        self.artifacts(stream_id).metadata().await
    }

    pub async fn init_segment(&self, stream_id: StreamId) -> Result<Option<Vec<u8>>> {
        self.artifacts(stream_id).init_segment().await
    }

    pub async fn segment(&self, stream_id: StreamId, index: u32) -> Result<Option<Vec<u8>>> {
        self.artifacts(stream_id).segment(index).await
    }
}
