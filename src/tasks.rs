//! Detached side effects that outlive the request that triggered them.
//!
//! Tasks are tracked so shutdown can wait for them. A panic inside a task is
//! logged and goes no further.

use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    /// Held shared while spawning and exclusively while closing, so no task
    /// slips in once `drain` has closed the tracker.
    admission: Arc<RwLock<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` in the background. Returns `false`, without running it,
    /// once [`drain`](Self::drain) has begun.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _admitted = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        if self.tracker.is_closed() {
            warn!(task = name, "shutdown in progress; background task not started");
            return false;
        }
        self.tracker.spawn(async move {
            match tokio::spawn(fut).await {
                Ok(()) => debug!(task = name, "background task finished"),
                Err(e) if e.is_panic() => error!(task = name, error = %e, "background task panicked"),
                Err(e) => warn!(task = name, error = %e, "background task cancelled"),
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting tasks and wait up to `grace` for running ones.
    /// Returns `true` if everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        {
            let _closing = self.admission.write().unwrap_or_else(PoisonError::into_inner);
            self.tracker.close();
        }
        info!(in_flight = self.tracker.len(), "completing background tasks");
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    in_flight = self.tracker.len(),
                    grace_secs = grace.as_secs(),
                    "background tasks still running after grace period"
                );
                false
            }
        }
    }
}
