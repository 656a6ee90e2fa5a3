//! Bounded worker pool for fire-and-forget side-effect tasks.
//!
//! Handlers stay non-blocking: submission enqueues immediately, the task
//! itself waits for one of the pool's permits before running. Closing the
//! pool makes further submissions no-ops so shutdown never races fresh
//! side-effects.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

pub const DEFAULT_WORKERS: usize = 20;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Submits a fire-and-forget task. `label` names the submission point
    /// in logs.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    debug!(label, "pool closed, dropping task");
                    return;
                }
            };
            task.await;
            drop(permit);
        });
    }

    /// Stops accepting new submissions; queued tasks that have not yet
    /// acquired a permit are dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_and_release_permits() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.spawn("test", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.available_workers(), 2);
    }

    #[tokio::test]
    async fn closed_pool_drops_new_tasks() {
        let pool = WorkerPool::new(1);
        pool.close();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.spawn("test", async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
