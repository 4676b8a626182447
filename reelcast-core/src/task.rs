//! Small task helpers shared by the job and stream runtimes.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{CoreError, Result};

/// Runs `fut` on its own task and waits for it.
///
/// Dropping the returned future (because the caller is being cancelled) does
/// not abort the spawned task, so cleanup started here always runs to the
/// end.
pub async fn run_shielded<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|err| CoreError::Internal(format!("shielded task failed: {err}")))
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
