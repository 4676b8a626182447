//! Producer side of a stream session.
//!
//! A transcode job writes artifacts into the cache as the pipeline produces
//! them and watches the heartbeats forwarded by [`super::StreamService`]. When
//! the client goes quiet for longer than the dead window the job tears the
//! stream down itself. Teardown stops the pipeline, cancels the subtitle
//! sub-job and deletes every artifact; it runs on its own task so the
//! cancellation that triggers it cannot cut it short.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    artifacts::StreamArtifacts,
    model::{
        SessionStreamEntry, SegmentInfo, StreamMetadata, SubtitleDocument, SubtitleRequest,
        SubtitleTopic, TranscodeClientEvent, TranscodeProgress, TranscodeSummary, TranscodeTopic,
    },
    pipeline::{TranscodeOutput, TranscodePipeline},
};
use crate::{
    cache::{Cache, expire_in},
    config::StreamConfig,
    error::{CoreError, Result},
    jobs::{JobContext, JobEmitter, JobHandler, JobId, JobQueue, WorkerEvent},
    task::run_shielded,
};

type SubtitleEvents = BoxStream<'static, Result<WorkerEvent<(), SubtitleDocument>>>;

pub struct StreamJobHandler {
    cache: Arc<dyn Cache>,
    pipeline: Arc<dyn TranscodePipeline>,
    subtitles: JobQueue<SubtitleTopic>,
    config: StreamConfig,
}

impl fmt::Debug for StreamJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamJobHandler")
            .field("cache", &self.cache)
            .field("dead_window", &self.config.heartbeat_dead_window)
            .finish_non_exhaustive()
    }
}

impl StreamJobHandler {
    pub fn new(
        cache: Arc<dyn Cache>,
        pipeline: Arc<dyn TranscodePipeline>,
        subtitles: JobQueue<SubtitleTopic>,
        config: StreamConfig,
    ) -> Self {
        Self {
            cache,
            pipeline,
            subtitles,
            config,
        }
    }
}

#[async_trait]
impl JobHandler<TranscodeTopic> for StreamJobHandler {
    async fn handle(&self, ctx: JobContext<TranscodeTopic>) -> Result<TranscodeSummary> {
        let JobContext {
            job_id,
            request,
            mut events,
            emitter,
            ..
        } = ctx;
        let artifacts = StreamArtifacts::new(Arc::clone(&self.cache), request.stream_id);
        let teardown = Teardown {
            artifacts: artifacts.clone(),
            subtitles: self.subtitles.clone(),
            session_id: request.session_id.clone(),
            entry: SessionStreamEntry {
                stream_id: request.stream_id,
                job_id,
            },
            subtitle_job: None,
            segment_count: 0,
            armed: true,
        };
        let mut run = StreamRun {
            artifacts,
            metadata: StreamMetadata::new(job_id, request.subtitle_track),
            teardown,
            emitter,
            config: self.config,
            init_written: false,
        };
        info!(stream = %request.stream_id, source = %request.source, "stream job started");

        let (mut subtitle_events, mut subtitles_done): (SubtitleEvents, bool) =
            match request.subtitle_track {
                Some(track) => {
                    let subtitle_job = self
                        .subtitles
                        .submit(&SubtitleRequest {
                            stream_id: request.stream_id,
                            source: request.source.clone(),
                            track,
                        })
                        .await?;
                    run.teardown.subtitle_job = Some(subtitle_job);
                    (self.subtitles.monitor(subtitle_job), false)
                }
                None => (Box::pin(futures::stream::empty()), true),
            };

        let mut outputs = self.pipeline.start(&request).await?;
        let mut transcode_done = false;
        let mut listening = true;
        let mut last_heartbeat = Instant::now();
        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !(transcode_done && subtitles_done) {
            tokio::select! {
                output = outputs.next(), if !transcode_done => match output {
                    Some(Ok(output)) => run.record(output).await?,
                    Some(Err(err)) => {
                        warn!(stream = %request.stream_id, error = %err, "transcode pipeline failed");
                        return Err(err);
                    }
                    None => {
                        run.finish_transcode().await?;
                        transcode_done = true;
                    }
                },
                event = subtitle_events.next(), if !subtitles_done => match event {
                    Some(Ok(WorkerEvent::Success(document))) => {
                        run.subtitles_ready(document).await?;
                        subtitles_done = true;
                    }
                    Some(Ok(WorkerEvent::Fail(reason))) => {
                        run.subtitles_failed(&reason).await?;
                        subtitles_done = true;
                    }
                    Some(Ok(WorkerEvent::Event(()))) => {}
                    Some(Err(err)) => {
                        warn!(stream = %request.stream_id, error = %err, "subtitle monitor error");
                    }
                    None => subtitles_done = true,
                },
                event = events.recv(), if listening => match event {
                    Some(TranscodeClientEvent::Heartbeat) => last_heartbeat = Instant::now(),
                    None => listening = false,
                },
                _ = watchdog.tick() => {
                    let silent = last_heartbeat.elapsed();
                    if silent > self.config.heartbeat_dead_window {
                        warn!(
                            target: "stream::heartbeat",
                            stream = %request.stream_id,
                            job = %job_id,
                            silent_for = ?silent,
                            "client stopped sending heartbeats, tearing stream down"
                        );
                        drop(outputs);
                        run.teardown.run().await?;
                        return Err(CoreError::Cancelled(format!(
                            "no heartbeat for {silent:?}"
                        )));
                    }
                }
            }
        }

        run.teardown.armed = false;
        info!(
            stream = %request.stream_id,
            segments = run.metadata.segment_count(),
            "stream job finished"
        );
        Ok(TranscodeSummary {
            segment_count: run.metadata.segment_count(),
            subtitles: run.metadata.subtitles.is_some(),
        })
    }
}

/// Mutable state of one running transcode job.
struct StreamRun {
    artifacts: StreamArtifacts,
    metadata: StreamMetadata,
    teardown: Teardown,
    emitter: JobEmitter<TranscodeTopic>,
    config: StreamConfig,
    init_written: bool,
}

impl StreamRun {
    async fn record(&mut self, output: TranscodeOutput) -> Result<()> {
        let expire_at = expire_in(self.config.artifact_ttl);
        match output {
            TranscodeOutput::Init { codec, data } => {
                self.artifacts.write_init(data, expire_at).await?;
                self.init_written = true;
                self.metadata.codec = codec;
                self.publish_metadata().await?;
                self.emitter.emit(&TranscodeProgress::InitReady).await
            }
            TranscodeOutput::Segment {
                index,
                duration,
                data,
            } => {
                if !self.init_written {
                    return Err(CoreError::Internal(format!(
                        "segment {index} produced before the init segment"
                    )));
                }
                let expected = self.metadata.segment_count();
                if index != expected {
                    return Err(CoreError::Internal(format!(
                        "segment {index} out of order, expected {expected}"
                    )));
                }
                self.artifacts.write_segment(index, data, expire_at).await?;
                self.metadata.segments.push(SegmentInfo { index, duration });
                self.teardown.segment_count = self.metadata.segment_count();
                self.publish_metadata().await?;
                debug!(stream = %self.artifacts.stream_id(), index, "segment stored");
                self.emitter
                    .emit(&TranscodeProgress::SegmentReady { index })
                    .await
            }
        }
    }

    async fn finish_transcode(&mut self) -> Result<()> {
        if !self.init_written {
            return Err(CoreError::Internal(
                "transcode pipeline ended without output".into(),
            ));
        }
        self.metadata.complete = true;
        self.publish_metadata().await
    }

    async fn subtitles_ready(&mut self, document: SubtitleDocument) -> Result<()> {
        self.teardown.subtitle_job = None;
        self.metadata.subtitles = Some(document.webvtt);
        if self.init_written {
            self.publish_metadata().await?;
        }
        self.emitter.emit(&TranscodeProgress::SubtitlesReady).await
    }

    /// Playback continues without subtitles.
    async fn subtitles_failed(&mut self, reason: &str) -> Result<()> {
        warn!(stream = %self.artifacts.stream_id(), reason, "subtitle extraction failed");
        self.teardown.subtitle_job = None;
        self.metadata.subtitle_track = None;
        if self.init_written {
            self.publish_metadata().await?;
        }
        Ok(())
    }

    /// Metadata is only written once the init segment exists, so a live
    /// record always implies a complete artifact set.
    async fn publish_metadata(&self) -> Result<()> {
        self.artifacts
            .write_metadata(&self.metadata, expire_in(self.config.artifact_ttl))
            .await
    }
}

/// Deletes a stream's artifacts when the job ends without success.
struct Teardown {
    artifacts: StreamArtifacts,
    subtitles: JobQueue<SubtitleTopic>,
    session_id: String,
    entry: SessionStreamEntry,
    subtitle_job: Option<JobId>,
    segment_count: u32,
    armed: bool,
}

impl Teardown {
    fn cleanup(&self) -> impl Future<Output = ()> + Send + 'static {
        let artifacts = self.artifacts.clone();
        let subtitles = self.subtitles.clone();
        let session_id = self.session_id.clone();
        let entry = self.entry;
        let subtitle_job = self.subtitle_job;
        let segment_count = self.segment_count;

        async move {
            let stream_id = artifacts.stream_id();
            if let Some(job) = subtitle_job
                && let Err(err) = subtitles.cancel(job).await
            {
                warn!(stream = %stream_id, error = %err, "failed to cancel subtitle job");
            }
            if let Err(err) = artifacts.delete_all(segment_count).await {
                warn!(stream = %stream_id, error = %err, "failed to delete stream artifacts");
            }
            if let Err(err) = artifacts.release_session(&session_id, &entry).await {
                warn!(stream = %stream_id, error = %err, "failed to release session mapping");
            }
            debug!(stream = %stream_id, segment_count, "stream torn down");
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.armed = false;
        run_shielded(self.cleanup()).await
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.cleanup());
            }
            Err(_) => {
                warn!(
                    stream = %self.artifacts.stream_id(),
                    "no runtime for stream teardown, leaving artifacts to expire"
                );
            }
        }
    }
}
