//! Heartbeat-driven stream sessions.
//!
//! [`StreamService`] runs on the request side: it creates sessions, answers
//! heartbeats and deletes streams. [`StreamJobHandler`] runs on workers and
//! turns transcoder output into cache artifacts. Both only meet through the
//! cache and the transcode job's event channels.

pub mod artifacts;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod subtitle;
pub mod worker;

pub use artifacts::StreamArtifacts;
pub use model::{
    CodecInfo, CreateStream, SegmentInfo, SessionStreamEntry, StreamHandle, StreamId,
    StreamMetadata, StreamStatus, SubtitleDocument, SubtitleRequest, SubtitleTopic,
    TranscodeClientEvent, TranscodeProgress, TranscodeRequest, TranscodeSummary, TranscodeTopic,
};
pub use pipeline::{SubtitleExtractor, TranscodeOutput, TranscodePipeline, TranscodeStream};
pub use service::StreamService;
pub use subtitle::SubtitleJobHandler;
pub use worker::StreamJobHandler;
