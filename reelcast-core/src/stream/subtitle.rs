use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use super::{
    model::{SubtitleDocument, SubtitleTopic},
    pipeline::SubtitleExtractor,
};
use crate::{
    error::Result,
    jobs::{JobContext, JobHandler},
};

/// Runs subtitle extraction as its own job so a transcode worker can cancel
/// it independently.
pub struct SubtitleJobHandler {
    extractor: Arc<dyn SubtitleExtractor>,
}

impl fmt::Debug for SubtitleJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubtitleJobHandler").finish_non_exhaustive()
    }
}

impl SubtitleJobHandler {
    pub fn new(extractor: Arc<dyn SubtitleExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl JobHandler<SubtitleTopic> for SubtitleJobHandler {
    async fn handle(&self, ctx: JobContext<SubtitleTopic>) -> Result<SubtitleDocument> {
        let request = ctx.request;
        debug!(stream = %request.stream_id, track = request.track, "extracting subtitles");
        self.extractor.extract(&request.source, request.track).await
    }
}
