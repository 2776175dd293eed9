use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded pool every blocking call goes through: SQLite access, queue
/// backend calls and engine subprocess supervision. Async callers await the
/// returned future and never block their scheduler thread.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("offload pool is closed")]
    Closed,
    #[error("offloaded task '{label}' failed: {message}")]
    Join { label: &'static str, message: String },
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `func` on tokio's blocking thread pool once a permit is free.
    pub async fn run_blocking<T, F>(&self, label: &'static str, func: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OffloadError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            func()
        })
        .await
        .map_err(|join_error| OffloadError::Join {
            label,
            message: join_error.to_string(),
        })
    }

    /// Spawns `fut` as a detached task gated by a permit. Dropping the
    /// returned handle does not cancel the task.
    pub fn spawn<T, Fut>(&self, fut: Fut) -> JoinHandle<Result<T, OffloadError>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| OffloadError::Closed)?;
            Ok(fut.await)
        })
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(16)
    }
}
