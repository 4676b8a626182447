//! Seams to the media tooling that actually produces bytes.
//!
//! ffmpeg argument construction and subtitle cue formatting live outside the
//! core; it only drives them through these traits.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::model::{CodecInfo, SubtitleDocument, TranscodeRequest};
use crate::error::Result;

/// One unit of transcoder output, in production order.
#[derive(Clone, Debug, PartialEq)]
pub enum TranscodeOutput {
    /// fMP4 init segment. Always precedes the first media segment.
    Init { codec: CodecInfo, data: Vec<u8> },
    /// fMP4 media segment `index`, numbered from zero without gaps.
    Segment {
        index: u32,
        duration: f64,
        data: Vec<u8>,
    },
}

/// Transcoder output for one stream. Dropping the stream must stop the
/// underlying process.
pub type TranscodeStream = BoxStream<'static, Result<TranscodeOutput>>;

#[async_trait]
pub trait TranscodePipeline: Send + Sync + 'static {
    async fn start(&self, request: &TranscodeRequest) -> Result<TranscodeStream>;
}

#[async_trait]
pub trait SubtitleExtractor: Send + Sync + 'static {
    async fn extract(&self, source: &str, track: u32) -> Result<SubtitleDocument>;
}
