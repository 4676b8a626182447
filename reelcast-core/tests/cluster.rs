mod support;

use std::{sync::Arc, time::Duration};

use reelcast_core::{
    Cache, CacheKeys, CoreError, DistributedLock, LockConfig,
    cache::{ClusterCache, InMemoryCache, expire_in},
};
use support::DownCache;

const LEASE: Duration = Duration::from_secs(10);

fn healthy(count: usize) -> Vec<Arc<InMemoryCache>> {
    (0..count).map(|_| Arc::new(InMemoryCache::new())).collect()
}

fn cluster(healthy: &[Arc<InMemoryCache>], down: usize) -> ClusterCache {
    let mut nodes: Vec<Arc<dyn Cache>> = healthy
        .iter()
        .map(|node| Arc::clone(node) as Arc<dyn Cache>)
        .collect();
    nodes.extend((0..down).map(|_| Arc::new(DownCache) as Arc<dyn Cache>));
    ClusterCache::new(nodes, 0.01).expect("cluster")
}

#[tokio::test]
async fn lock_survives_a_minority_of_failed_nodes() {
    let nodes = healthy(3);
    let cache = cluster(&nodes, 2);

    let lock = cache
        .try_acquire("Lock:library-scan", LEASE)
        .await
        .expect("quorum")
        .expect("uncontended");
    assert!(lock.is_valid());
    assert!(lock.remaining() < LEASE);
}

#[tokio::test]
async fn lock_fails_without_a_majority() {
    let nodes = healthy(2);
    let cache = cluster(&nodes, 3);

    let err = cache
        .try_acquire("Lock:library-scan", LEASE)
        .await
        .expect_err("2 of 5 cannot grant a lock");
    assert!(err.is_backend_unavailable(), "{err}");
    assert!(matches!(err, CoreError::Quorum { required: 3, .. }));

    for node in &nodes {
        assert!(
            !node.exists("Lock:library-scan").await.expect("exists"),
            "minority acquisition must be rolled back"
        );
    }
}

#[tokio::test]
async fn contended_lock_rolls_back_partial_acquisition() {
    let nodes = healthy(5);
    let key = "Lock:library-scan";
    for node in &nodes[..3] {
        node.put(key, b"other-holder".to_vec(), expire_in(LEASE))
            .await
            .expect("seed");
    }
    let cache = cluster(&nodes, 0);

    assert!(cache.try_acquire(key, LEASE).await.expect("answered").is_none());
    for node in &nodes[3..] {
        assert!(!node.exists(key).await.expect("exists"));
    }
    for node in &nodes[..3] {
        assert_eq!(
            node.get(key).await.expect("get"),
            Some(b"other-holder".to_vec())
        );
    }
}

#[tokio::test]
async fn distributed_lock_extends_and_releases_over_a_cluster() {
    let nodes = healthy(4);
    let cache: Arc<dyn Cache> = Arc::new(cluster(&nodes, 1));
    let locks = DistributedLock::new(cache, LockConfig::default());
    let name = "transcode:42";

    let lock = locks
        .try_acquire(name, LEASE)
        .await
        .expect("quorum")
        .expect("free");
    assert!(locks.try_acquire(name, LEASE).await.expect("quorum").is_none());

    let extended = locks
        .extend(&lock, None)
        .await
        .expect("quorum")
        .expect("still owned");
    assert_ne!(extended.lease_id, lock.lease_id);

    assert!(!locks.release(&lock).await.expect("release"), "stale lease");
    assert!(locks.release(&extended).await.expect("release"));
    for node in &nodes {
        assert!(!node.exists(&CacheKeys::lock(name)).await.expect("exists"));
    }
}

#[tokio::test]
async fn cluster_reads_need_majority_agreement() {
    let nodes = healthy(3);
    let cache = cluster(&nodes, 0);

    cache
        .put("Stream:metadata:1", b"v1".to_vec(), expire_in(LEASE))
        .await
        .expect("put");
    nodes[0].del("Stream:metadata:1").await.expect("del");
    assert_eq!(
        cache.get("Stream:metadata:1").await.expect("get"),
        Some(b"v1".to_vec())
    );

    nodes[1].del("Stream:metadata:1").await.expect("del");
    assert_eq!(cache.get("Stream:metadata:1").await.expect("get"), None);
}

#[tokio::test]
async fn bounded_acquire_gives_up_after_its_wait() {
    let nodes = healthy(3);
    let cache: Arc<dyn Cache> = Arc::new(cluster(&nodes, 0));
    let locks = DistributedLock::new(cache, LockConfig::default());

    let _held = locks
        .try_acquire("session", LEASE)
        .await
        .expect("quorum")
        .expect("free");
    let err = locks
        .acquire("session", LEASE, Duration::from_millis(120))
        .await
        .expect_err("held elsewhere");
    assert!(matches!(err, CoreError::LockUnavailable(_)), "{err}");
}
