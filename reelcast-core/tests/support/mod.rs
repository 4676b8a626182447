#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelcast_core::{
    Cache, CoreConfig, CoreError, Result, Runtime,
    cache::InMemoryCache,
    jobs::InMemoryJobBackend,
    stream::{
        CodecInfo, SubtitleDocument, SubtitleExtractor, TranscodeOutput, TranscodePipeline,
        TranscodeRequest, TranscodeStream,
    },
};

/// Cache node that is always unreachable.
#[derive(Debug, Default)]
pub struct DownCache;

fn down<T>() -> Result<T> {
    Err(CoreError::Unavailable("node down".into()))
}

#[async_trait]
impl Cache for DownCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        down()
    }

    async fn put(&self, _key: &str, _value: Vec<u8>, _expire_at: DateTime<Utc>) -> Result<()> {
        down()
    }

    async fn del(&self, _key: &str) -> Result<bool> {
        down()
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        down()
    }

    async fn expire(&self, _key: &str, _expire_at: DateTime<Utc>) -> Result<bool> {
        down()
    }

    async fn set_if_absent(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<bool> {
        down()
    }

    async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> Result<bool> {
        down()
    }

    async fn replace_if_equals(
        &self,
        _key: &str,
        _expected: &[u8],
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> Result<bool> {
        down()
    }
}

/// Emits an init segment and `segments` media segments, then either ends or
/// idles until dropped.
#[derive(Debug, Clone)]
pub struct FakePipeline {
    segments: u32,
    finish: bool,
    pub started: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
}

impl FakePipeline {
    pub fn endless(segments: u32) -> Self {
        Self {
            segments,
            finish: false,
            started: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn finite(segments: u32) -> Self {
        Self {
            finish: true,
            ..Self::endless(segments)
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct StopCounter(Arc<AtomicUsize>);

impl Drop for StopCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranscodePipeline for FakePipeline {
    async fn start(&self, request: &TranscodeRequest) -> Result<TranscodeStream> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let stop = StopCounter(Arc::clone(&self.stopped));
        let segments = self.segments;
        let finish = self.finish;
        let source = request.source.clone();
        Ok(Box::pin(stream! {
            let _stop = stop;
            yield Ok::<_, CoreError>(TranscodeOutput::Init {
                codec: CodecInfo {
                    video_codec: Some("h264".into()),
                    audio_codec: Some("aac".into()),
                    width: Some(1920),
                    height: Some(1080),
                    codecs: Some("avc1.640028,mp4a.40.2".into()),
                },
                data: source.into_bytes(),
            });
            for index in 0..segments {
                yield Ok(TranscodeOutput::Segment {
                    index,
                    duration: 4.0,
                    data: vec![index as u8; 8],
                });
            }
            if !finish {
                futures::future::pending::<()>().await;
            }
        }))
    }
}

#[derive(Debug, Default)]
pub struct FakeExtractor;

#[async_trait]
impl SubtitleExtractor for FakeExtractor {
    async fn extract(&self, _source: &str, track: u32) -> Result<SubtitleDocument> {
        Ok(SubtitleDocument {
            language: Some("en".into()),
            webvtt: format!("WEBVTT\n\nNOTE track {track}\n"),
        })
    }
}

/// In-process runtime with stream workers registered.
pub async fn stream_runtime(pipeline: FakePipeline) -> Runtime {
    let config = CoreConfig::default();
    let runtime = Runtime::from_parts(
        Arc::new(InMemoryCache::new()),
        Arc::new(InMemoryJobBackend::new(config.jobs)),
        config,
    );
    runtime
        .register_stream_workers(Arc::new(pipeline), Arc::new(FakeExtractor))
        .await;
    runtime
}

/// Polls `check` every 10ms until it holds; panics after 300 attempts.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
