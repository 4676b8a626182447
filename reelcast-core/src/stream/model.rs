use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    jobs::{JobId, JobTopic},
};

/// Generated identifier for one stream's artifact set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(StreamId)
            .map_err(|err| CoreError::Invalid(format!("invalid stream id {s:?}: {err}")))
    }
}

/// Status reported to a polling client. Derived on every heartbeat, never
/// stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Pending,
    Available,
    Canceled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// RFC 6381 string for the HLS playlist, e.g. `avc1.640028,mp4a.40.2`.
    pub codecs: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub index: u32,
    /// Seconds.
    pub duration: f64,
}

/// Record stored at `StreamMetadata:<id>` once the worker has produced the
/// init segment. Before that the key holds an empty placeholder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub job_id: JobId,
    pub codec: CodecInfo,
    pub segments: Vec<SegmentInfo>,
    pub subtitle_track: Option<u32>,
    /// WebVTT document, present once the subtitle sub-job succeeded.
    pub subtitles: Option<String>,
    pub complete: bool,
}

impl StreamMetadata {
    pub fn new(job_id: JobId, subtitle_track: Option<u32>) -> Self {
        Self {
            job_id,
            codec: CodecInfo::default(),
            segments: Vec::new(),
            subtitle_track,
            subtitles: None,
            complete: false,
        }
    }

    pub fn segment_count(&self) -> u32 {
        u32::try_from(self.segments.len()).unwrap_or(u32::MAX)
    }

    pub fn subtitles_pending(&self) -> bool {
        self.subtitle_track.is_some() && self.subtitles.is_none()
    }

    /// Playable: at least one segment, and subtitles if any were asked for.
    pub fn is_available(&self) -> bool {
        !self.segments.is_empty() && !self.subtitles_pending()
    }
}

/// Value stored at `SessionStreamJobId:<session>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStreamEntry {
    pub stream_id: StreamId,
    pub job_id: JobId,
}

/// What a client asks for when it starts playback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStream {
    pub session_id: String,
    /// Media location understood by the transcode pipeline.
    pub source: String,
    pub subtitle_track: Option<u32>,
    /// Seconds into the media where playback starts.
    #[serde(default)]
    pub start_offset: u32,
}

/// Returned to the caller of `create_stream`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub stream_id: StreamId,
    pub job_id: JobId,
}

/// Request of a transcode job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub stream_id: StreamId,
    pub session_id: String,
    pub source: String,
    pub subtitle_track: Option<u32>,
    pub start_offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeClientEvent {
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeProgress {
    InitReady,
    SegmentReady { index: u32 },
    SubtitlesReady,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeSummary {
    pub segment_count: u32,
    pub subtitles: bool,
}

/// Per-stream transcode jobs.
#[derive(Debug)]
pub struct TranscodeTopic;

impl JobTopic for TranscodeTopic {
    const NAME: &'static str = "stream-transcode";
    type Request = TranscodeRequest;
    type Response = TranscodeSummary;
    type ClientEvent = TranscodeClientEvent;
    type WorkerEvent = TranscodeProgress;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleRequest {
    pub stream_id: StreamId,
    pub source: String,
    pub track: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleDocument {
    pub language: Option<String>,
    pub webvtt: String,
}

/// Subtitle extraction jobs spawned by transcode workers.
#[derive(Debug)]
pub struct SubtitleTopic;

impl JobTopic for SubtitleTopic {
    const NAME: &'static str = "stream-subtitles";
    type Request = SubtitleRequest;
    type Response = SubtitleDocument;
    type ClientEvent = ();
    type WorkerEvent = ();
}
