//! # Reelcast Core
//!
//! Coordination layer of the Reelcast media server: the pieces that keep
//! asynchronous, cancellable work consistent across processes.
//!
//! ## Overview
//!
//! - **Cache**: keyed byte storage with absolute expiry, in three tiers
//!   (in-process, one Redis node, a quorum of Redis nodes)
//! - **Distributed Lock**: lease locks with compare-and-act release and
//!   extension, plus a renewal helper for long critical sections
//! - **Job Queue**: typed `submit` / `monitor` / `cancel` / `notify` over
//!   interchangeable backends mirroring the cache tiers
//! - **Stream Sessions**: transcode jobs whose artifacts live only while a
//!   client keeps sending heartbeats
//!
//! ## Feature Flags
//!
//! - `redis` (default): single-node and cluster backends. Without it only
//!   the in-process tier is available.
//!
//! ## Example
//!
//! ```no_run
//! use reelcast_core::{CoreConfig, Runtime, stream::CreateStream};
//!
//! async fn start(config: CoreConfig) -> reelcast_core::Result<()> {
//!     let runtime = Runtime::connect(config).await?;
//!     let streams = runtime.stream_service();
//!     let handle = streams
//!         .create_stream(CreateStream {
//!             session_id: "session-1".into(),
//!             source: "/media/movie.mkv".into(),
//!             subtitle_track: None,
//!             start_offset: 0,
//!         })
//!         .await?;
//!     println!("stream {} runs as job {}", handle.stream_id, handle.job_id);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod runtime;
pub mod stream;
pub mod task;

pub use cache::{Cache, CacheExt, CacheKeys};
pub use config::{CacheConfig, CoreConfig, JobQueueConfig, LockConfig, StreamConfig};
pub use error::{CoreError, Result};
pub use jobs::{JobId, JobQueue, JobQueueRegistry, JobTopic};
pub use lock::{CacheLock, DistributedLock, LeaseId, LockGuard};
pub use runtime::Runtime;
