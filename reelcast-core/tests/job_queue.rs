use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reelcast_core::{
    CoreError, JobQueueConfig, JobQueueRegistry, JobTopic, Result,
    jobs::{InMemoryJobBackend, JobContext, JobHandler, WorkerEvent},
};

struct Resize;

impl JobTopic for Resize {
    const NAME: &'static str = "resize";
    type Request = u32;
    type Response = u32;
    type ClientEvent = ();
    type WorkerEvent = String;
}

/// Doubles the request; odd sizes are rejected.
struct Doubler;

#[async_trait]
impl JobHandler<Resize> for Doubler {
    async fn handle(&self, ctx: JobContext<Resize>) -> Result<u32> {
        ctx.emitter.emit(&format!("resizing {}", ctx.request)).await?;
        if ctx.request % 2 == 1 {
            return Err(CoreError::Invalid(format!("odd size {}", ctx.request)));
        }
        Ok(ctx.request * 2)
    }
}

fn registry() -> JobQueueRegistry {
    let config = JobQueueConfig::default();
    JobQueueRegistry::new(Arc::new(InMemoryJobBackend::new(config)), config)
}

async fn collect(
    events: impl futures::Stream<Item = Result<WorkerEvent<String, u32>>>,
) -> Vec<WorkerEvent<String, u32>> {
    tokio::time::timeout(Duration::from_secs(5), events.map(|e| e.expect("event")).collect())
        .await
        .expect("monitor ended")
}

#[tokio::test]
async fn submitted_job_ends_with_exactly_one_success() {
    let registry = registry();
    registry.register::<Resize, _>(Doubler).await;
    assert_eq!(registry.worker_count(Resize::NAME).await, 1);

    let queue = registry.queue::<Resize>();
    let job = queue.submit(&42).await.expect("submit");
    let events = collect(queue.monitor(job)).await;

    assert_eq!(
        events,
        vec![
            WorkerEvent::Event("resizing 42".into()),
            WorkerEvent::Success(84),
        ]
    );
    registry.shutdown().await;
}

#[tokio::test]
async fn failed_job_does_not_stop_the_worker() {
    let registry = registry();
    registry.register::<Resize, _>(Doubler).await;
    let queue = registry.queue::<Resize>();

    let bad = queue.submit(&3).await.expect("submit");
    let events = collect(queue.monitor(bad)).await;
    match events.last() {
        Some(WorkerEvent::Fail(reason)) => assert!(reason.contains("odd size 3"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }

    let good = queue.submit(&4).await.expect("submit");
    let events = collect(queue.monitor(good)).await;
    assert_eq!(events.last(), Some(&WorkerEvent::Success(8)));
    registry.shutdown().await;
}

#[tokio::test]
async fn every_monitor_sees_the_full_history() {
    let registry = registry();
    let queue = registry.queue::<Resize>();
    let job = queue.submit(&10).await.expect("submit");

    let early = queue.monitor(job);
    registry.register::<Resize, _>(Doubler).await;
    let first = collect(early).await;
    let second = collect(queue.monitor(job)).await;

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    registry.shutdown().await;
}

#[tokio::test]
async fn jobs_submitted_before_any_worker_are_picked_up() {
    let registry = registry();
    let queue = registry.queue::<Resize>();
    let jobs = [
        queue.submit(&2).await.expect("submit"),
        queue.submit(&6).await.expect("submit"),
    ];

    registry.register::<Resize, _>(Doubler).await;
    let mut results = Vec::new();
    for job in jobs {
        results.push(collect(queue.monitor(job)).await.pop());
    }
    assert_eq!(
        results,
        vec![Some(WorkerEvent::Success(4)), Some(WorkerEvent::Success(12))]
    );
    registry.shutdown().await;
    assert_eq!(registry.worker_count(Resize::NAME).await, 0);
}
