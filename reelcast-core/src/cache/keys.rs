use std::fmt::Display;

/// Cache key namespaces. Data and lock keys share one keyspace, so every
/// family carries its own prefix.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeys;

impl CacheKeys {
    pub fn stream_metadata(stream_id: impl Display) -> String {
        format!("StreamMetadata:{stream_id}")
    }

    pub fn stream_segment(stream_id: impl Display, index: u32) -> String {
        format!("StreamSegmentM4s:{stream_id}:{index}")
    }

    pub fn stream_init(stream_id: impl Display) -> String {
        format!("StreamInitMp4:{stream_id}")
    }

    pub fn session_stream(session_id: &str) -> String {
        format!("SessionStreamJobId:{session_id}")
    }

    pub fn lock(name: &str) -> String {
        format!("Lock:{name}")
    }

    /// Dispatch list for a job topic.
    pub fn job_queue(topic: &str) -> String {
        format!("JobQueue:{topic}")
    }

    /// Append log of worker -> monitor events for one job.
    pub fn job_worker_events(topic: &str, job_id: impl Display) -> String {
        format!("JobWorkerEvents:{topic}:{job_id}")
    }

    /// Append log of client -> worker events for one job.
    pub fn job_client_events(topic: &str, job_id: impl Display) -> String {
        format!("JobClientEvents:{topic}:{job_id}")
    }

    /// Marker proving a single worker claimed a job.
    pub fn job_claim(topic: &str, job_id: impl Display) -> String {
        Self::lock(&format!("JobClaim:{topic}:{job_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_do_not_overlap() {
        assert_eq!(CacheKeys::stream_metadata("s1"), "StreamMetadata:s1");
        assert_eq!(CacheKeys::stream_segment("s1", 7), "StreamSegmentM4s:s1:7");
        assert_eq!(CacheKeys::stream_init("s1"), "StreamInitMp4:s1");
        assert_eq!(
            CacheKeys::session_stream("abc"),
            "SessionStreamJobId:abc"
        );
        assert_eq!(CacheKeys::lock("abc"), "Lock:abc");
        assert!(CacheKeys::job_claim("stream", "j1").starts_with("Lock:"));
    }
}
