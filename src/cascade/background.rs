//! Detached work that must never block or crash the request path.

use crate::error::HeimdallError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Bounded spawn-and-forget runner. Failures and panics of detached tasks
/// end up in the logs; when saturated, new work is dropped.
#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl BackgroundTasks {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Spawn `fut` in the background. Returns false if the task was dropped
    /// because too many are already running or the runner is shut down.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<(), HeimdallError>> + Send + 'static,
    {
        if self.tracker.is_closed() {
            debug!(task = name, "Background runner closed, dropping task");
            return false;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, "Background runner saturated, dropping task");
                return false;
            }
        };

        self.tracker.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
                Err(_) => error!(task = name, "Background task panicked"),
            }
            drop(permit);
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for everything spawned so far, then accept work again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait for running tasks, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending = pending, "Waiting for background tasks");
        }

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.tracker.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Background tasks did not finish before shutdown"
                );
                false
            }
        }
    }
}
