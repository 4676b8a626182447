use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::model::{SessionStreamEntry, StreamId, StreamMetadata};
use crate::{
    cache::{Cache, CacheExt, CacheKeys},
    error::Result,
};

/// Cache view over the artifacts of one stream.
#[derive(Clone)]
pub struct StreamArtifacts {
    cache: Arc<dyn Cache>,
    stream_id: StreamId,
}

impl fmt::Debug for StreamArtifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamArtifacts")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl StreamArtifacts {
    pub fn new(cache: Arc<dyn Cache>, stream_id: StreamId) -> Self {
        Self { cache, stream_id }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn metadata_key(&self) -> String {
        CacheKeys::stream_metadata(self.stream_id)
    }

    fn init_key(&self) -> String {
        CacheKeys::stream_init(self.stream_id)
    }

    fn segment_key(&self, index: u32) -> String {
        CacheKeys::stream_segment(self.stream_id, index)
    }

    /// Empty metadata record marking a stream whose worker has not started.
    pub async fn write_placeholder(&self, expire_at: DateTime<Utc>) -> Result<()> {
        self.cache
            .put(&self.metadata_key(), Vec::new(), expire_at)
            .await
    }

    pub async fn write_metadata(
        &self,
        metadata: &StreamMetadata,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        self.cache
            .put_json(&self.metadata_key(), metadata, expire_at)
            .await
    }

    /// `None` while the key is missing or still holds the placeholder.
    pub async fn metadata(&self) -> Result<Option<StreamMetadata>> {
        match self.cache.get(&self.metadata_key()).await? {
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn write_init(&self, data: Vec<u8>, expire_at: DateTime<Utc>) -> Result<()> {
        self.cache.put(&self.init_key(), data, expire_at).await
    }

    pub async fn init_segment(&self) -> Result<Option<Vec<u8>>> {
        self.cache.get(&self.init_key()).await
    }

    pub async fn write_segment(
        &self,
        index: u32,
        data: Vec<u8>,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        self.cache.put(&self.segment_key(index), data, expire_at).await
    }

    pub async fn segment(&self, index: u32) -> Result<Option<Vec<u8>>> {
        self.cache.get(&self.segment_key(index)).await
    }

    /// Keys a live stream must hold. Init and media segments only count
    /// once real metadata exists, since the worker writes them first.
    fn required_keys(&self, metadata: Option<&StreamMetadata>) -> Vec<String> {
        let mut keys = vec![self.metadata_key()];
        if let Some(metadata) = metadata {
            keys.push(self.init_key());
            keys.extend((0..metadata.segment_count()).map(|index| self.segment_key(index)));
        }
        keys
    }

    /// Moves the expiry of every artifact and of `session_key` to
    /// `expire_at`. Missing keys are skipped.
    pub async fn extend_all(
        &self,
        metadata: Option<&StreamMetadata>,
        session_key: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        for key in self.required_keys(metadata) {
            self.cache.expire(&key, expire_at).await?;
        }
        self.cache.expire(session_key, expire_at).await?;
        Ok(())
    }

    /// Whether every artifact and `session_key` still exist.
    pub async fn all_exist(
        &self,
        metadata: Option<&StreamMetadata>,
        session_key: &str,
    ) -> Result<bool> {
        if !self.cache.exists(session_key).await? {
            return Ok(false);
        }
        for key in self.required_keys(metadata) {
            if !self.cache.exists(&key).await? {
                debug!(target: "stream::heartbeat", key = %key, "artifact missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Deletes segments `0..segment_count`, the init segment and the
    /// metadata, whether or not they still exist.
    pub async fn delete_all(&self, segment_count: u32) -> Result<()> {
        for index in 0..segment_count {
            self.cache.del(&self.segment_key(index)).await?;
        }
        self.cache.del(&self.init_key()).await?;
        self.cache.del(&self.metadata_key()).await?;
        Ok(())
    }

    /// Drops the session mapping only while it still points at `entry`, so
    /// a replacement stream for the same session keeps its mapping.
    pub async fn release_session(
        &self,
        session_id: &str,
        entry: &SessionStreamEntry,
    ) -> Result<bool> {
        let expected = serde_json::to_vec(entry)?;
        self.cache
            .delete_if_equals(&CacheKeys::session_stream(session_id), &expected)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{InMemoryCache, expire_in},
        jobs::JobId,
        stream::model::SegmentInfo,
    };
    use std::time::Duration;

    fn metadata(segments: u32) -> StreamMetadata {
        let mut metadata = StreamMetadata::new(JobId::new(), None);
        metadata.segments = (0..segments)
            .map(|index| SegmentInfo {
                index,
                duration: 4.0,
            })
            .collect();
        metadata
    }

    async fn populated(segments: u32) -> (Arc<dyn Cache>, StreamArtifacts, StreamMetadata) {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let artifacts = StreamArtifacts::new(Arc::clone(&cache), StreamId::new());
        let expire_at = expire_in(Duration::from_secs(60));
        let metadata = metadata(segments);
        artifacts.write_init(b"init".to_vec(), expire_at).await.expect("init");
        for index in 0..segments {
            artifacts
                .write_segment(index, vec![index as u8], expire_at)
                .await
                .expect("segment");
        }
        artifacts.write_metadata(&metadata, expire_at).await.expect("metadata");
        cache
            .put("SessionStreamJobId:s1", b"x".to_vec(), expire_at)
            .await
            .expect("session");
        (cache, artifacts, metadata)
    }

    #[tokio::test]
    async fn placeholder_reads_as_no_metadata() {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let artifacts = StreamArtifacts::new(Arc::clone(&cache), StreamId::new());
        artifacts
            .write_placeholder(expire_in(Duration::from_secs(30)))
            .await
            .expect("placeholder");

        assert!(artifacts.metadata().await.expect("read").is_none());
        assert!(
            cache
                .exists(&CacheKeys::stream_metadata(artifacts.stream_id()))
                .await
                .expect("exists")
        );
    }

    #[tokio::test]
    async fn any_missing_artifact_fails_the_check() {
        let (cache, artifacts, metadata) = populated(3).await;
        let session = "SessionStreamJobId:s1";
        assert!(artifacts.all_exist(Some(&metadata), session).await.expect("check"));

        cache
            .del(&CacheKeys::stream_segment(artifacts.stream_id(), 1))
            .await
            .expect("del");
        assert!(!artifacts.all_exist(Some(&metadata), session).await.expect("check"));
    }

    #[tokio::test]
    async fn delete_all_is_idempotent() {
        let (cache, artifacts, metadata) = populated(2).await;
        artifacts.delete_all(metadata.segment_count()).await.expect("delete");
        artifacts.delete_all(metadata.segment_count()).await.expect("delete again");

        let id = artifacts.stream_id();
        for key in [
            CacheKeys::stream_metadata(id),
            CacheKeys::stream_init(id),
            CacheKeys::stream_segment(id, 0),
            CacheKeys::stream_segment(id, 1),
        ] {
            assert!(!cache.exists(&key).await.expect("exists"), "{key} survived");
        }
    }
}
