//! Operator shutdown: one flag the supervisor and the recovery loops poll.
//!
//! Stopping has two halves here: the flag flips (Ctrl+C, or the
//! control-plane front-end going away), and the generation-scoped task set
//! (runner, dispatcher, raise scheduler, session refresher) must be torn
//! down so no reply or delivery fires into a half-stopped process. The
//! signal handler runs the teardown hook itself rather than leaving that
//! to whoever notices the flag first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::sleep;
use tracing::info;

const POLL_SLICE: Duration = Duration::from_millis(50);

pub struct ShutdownManager {
    flag: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawns the Ctrl+C handler. `teardown` runs once, right after the
    /// flag flips, and is expected to stop the generation-scoped tasks
    /// (bump the generation token, wake the supervisor).
    pub fn spawn_signal_handler(&self, teardown: impl FnOnce() + Send + 'static) {
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, stopping the worker loops");
                flag.store(false, Ordering::Release);
                teardown();
            }
        });
    }

    /// Requests shutdown from inside the process (front-end detached,
    /// fatal supervisor state).
    pub fn trigger(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Shared flag for tasks that only need to poll.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Recovery pacing between reconnection attempts: sleeps `duration`
    /// unless shutdown arrives first. Returns false when cut short, so the
    /// caller abandons its retry instead of re-probing a dying process.
    pub async fn backoff(&self, duration: Duration) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            if !self.is_running() {
                return false;
            }
            sleep(POLL_SLICE).await;
            elapsed += POLL_SLICE;
        }
        self.is_running()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backoff_runs_to_completion_while_running() {
        let shutdown = ShutdownManager::new();
        assert!(shutdown.backoff(Duration::from_millis(60)).await);
        assert!(shutdown.is_running());
    }

    #[tokio::test]
    async fn trigger_cuts_backoff_short() {
        let shutdown = ShutdownManager::new();
        let flag = shutdown.flag();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            flag.store(false, Ordering::Release);
        });
        assert!(!shutdown.backoff(Duration::from_secs(5)).await);
        assert!(!shutdown.is_running());
    }
}
