//! Majority-agreement cache over independent nodes.
//!
//! Every operation is issued to all nodes concurrently and only counts as
//! done once a strict majority answered successfully. Lock acquisition is
//! Redlock-style: the lease is written with `set_if_absent` on each node and
//! held only if a strict majority accepted it, otherwise the partial writes
//! are rolled back. This survives minority node loss but is not
//! linearizable under partition or heavy clock drift.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use super::Cache;
use crate::error::{CoreError, Result};

/// Fixed allowance added to the proportional drift, in the spirit of the
/// Redlock reference algorithm.
const DRIFT_FLOOR: Duration = Duration::from_millis(2);

/// Strict majority of `nodes`.
pub fn quorum(nodes: usize) -> usize {
    nodes / 2 + 1
}

/// Whether `successes` out of `nodes` attempts reach a strict majority.
pub fn quorum_reached(successes: usize, nodes: usize) -> bool {
    nodes > 0 && successes >= quorum(nodes)
}

#[derive(Clone)]
pub struct ClusterCache {
    nodes: Arc<Vec<Arc<dyn Cache>>>,
    drift_factor: f64,
    node_timeout: Duration,
}

impl fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCache")
            .field("nodes", &self.nodes.len())
            .field("quorum", &quorum(self.nodes.len()))
            .field("drift_factor", &self.drift_factor)
            .field("node_timeout", &self.node_timeout)
            .finish()
    }
}

impl ClusterCache {
    pub fn new(nodes: Vec<Arc<dyn Cache>>, drift_factor: f64) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CoreError::Invalid(
                "cluster cache needs at least one node".into(),
            ));
        }
        Ok(Self {
            nodes: Arc::new(nodes),
            drift_factor,
            node_timeout: Duration::from_millis(500),
        })
    }

    /// Caps how long a single node may take before it counts as failed.
    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    async fn fan_out<'a, T, F, Fut>(&'a self, op: F) -> Vec<Result<T>>
    where
        F: Fn(&'a Arc<dyn Cache>) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let timeout = self.node_timeout;
        join_all(self.nodes.iter().map(|node| {
            let call = op(node);
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Unavailable(format!(
                        "cache node did not answer within {timeout:?}"
                    ))),
                }
            }
        }))
        .await
    }

    /// Successful answers, or a quorum error when too few nodes answered.
    fn answers<T>(&self, operation: &'static str, results: Vec<Result<T>>) -> Result<Vec<T>> {
        let total = results.len();
        let mut answers = Vec::with_capacity(total);
        for result in results {
            match result {
                Ok(value) => answers.push(value),
                Err(err) => {
                    debug!(operation, error = %err, "cache node failed");
                }
            }
        }
        if quorum_reached(answers.len(), total) {
            Ok(answers)
        } else {
            warn!(
                operation,
                successes = answers.len(),
                nodes = total,
                "cluster quorum not reached"
            );
            Err(CoreError::Quorum {
                operation,
                successes: answers.len(),
                required: quorum(total),
            })
        }
    }

    /// Number of nodes that reported `true`, after checking enough answered.
    fn agreeing(&self, operation: &'static str, results: Vec<Result<bool>>) -> Result<usize> {
        Ok(self
            .answers(operation, results)?
            .into_iter()
            .filter(|flag| *flag)
            .count())
    }
}

#[async_trait]
impl Cache for ClusterCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let results = self.fan_out(|node| node.get(key)).await;
        let answers = self.answers("get", results)?;

        let mut tally: HashMap<Vec<u8>, usize> = HashMap::new();
        for value in answers.into_iter().flatten() {
            *tally.entry(value).or_default() += 1;
        }
        let total = self.nodes.len();
        Ok(tally
            .into_iter()
            .find(|(_, votes)| quorum_reached(*votes, total))
            .map(|(value, _)| value))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expire_at: DateTime<Utc>,
    ) -> Result<()> {
        let value = &value;
        let results = self
            .fan_out(|node| node.put(key, value.clone(), expire_at))
            .await;
        self.answers("put", results).map(|_| ())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let results = self.fan_out(|node| node.del(key)).await;
        Ok(self.agreeing("del", results)? > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let results = self.fan_out(|node| node.exists(key)).await;
        let present = self.agreeing("exists", results)?;
        Ok(quorum_reached(present, self.nodes.len()))
    }

    async fn expire(&self, key: &str, expire_at: DateTime<Utc>) -> Result<bool> {
        let results = self.fan_out(|node| node.expire(key, expire_at)).await;
        let updated = self.agreeing("expire", results)?;
        Ok(quorum_reached(updated, self.nodes.len()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let value = &value;
        let results = self
            .fan_out(|node| node.set_if_absent(key, value.clone(), ttl))
            .await;
        let acquired = results
            .iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();

        if quorum_reached(acquired, self.nodes.len()) {
            return Ok(true);
        }

        if acquired > 0 {
            debug!(key, acquired, nodes = self.nodes.len(), "rolling back minority lock");
            // Best effort: nodes that fail here expire the lease on their own.
            let _ = self
                .fan_out(|node| node.delete_if_equals(key, value))
                .await;
        }

        let answered = results.iter().filter(|result| result.is_ok()).count();
        if quorum_reached(answered, self.nodes.len()) {
            Ok(false)
        } else {
            Err(CoreError::Quorum {
                operation: "set_if_absent",
                successes: acquired,
                required: quorum(self.nodes.len()),
            })
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let results = self
            .fan_out(|node| node.delete_if_equals(key, expected))
            .await;
        let deleted = results
            .iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        Ok(quorum_reached(deleted, self.nodes.len()))
    }

    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let value = &value;
        let results = self
            .fan_out(|node| node.replace_if_equals(key, expected, value.clone(), ttl))
            .await;
        let replaced = results
            .iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        Ok(quorum_reached(replaced, self.nodes.len()))
    }

    fn clock_drift(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + DRIFT_FLOOR
    }
}
