//! Background tombstone cleanup.

use crate::index::HnswIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Periodically runs [`HnswIndex::cleanup_tombstones`] on the blocking pool.
///
/// Passes never overlap: the next interval starts after the previous pass
/// returns. Must be spawned from within a tokio runtime.
pub struct CleanupCycle {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl CleanupCycle {
    /// Start a cycle that follows the index's `cleanup_interval_secs`,
    /// re-read before every wait so runtime changes apply.
    pub fn start(index: Arc<HnswIndex>) -> Self {
        Self::run(index, None)
    }

    /// Start a cycle with a fixed interval.
    pub fn spawn(index: Arc<HnswIndex>, interval: Duration) -> Self {
        Self::run(index, Some(interval))
    }

    fn run(index: Arc<HnswIndex>, fixed: Option<Duration>) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let interval = fixed.unwrap_or_else(|| {
                    Duration::from_secs(index.tuning().cleanup_interval_secs)
                });
                tokio::select! {
                    _ = sleep(interval) => {
                        let index = index.clone();
                        match tokio::task::spawn_blocking(move || index.cleanup_tombstones()).await {
                            Ok(Ok(0)) => {}
                            Ok(Ok(reclaimed)) => tracing::debug!(reclaimed, "cleanup cycle pass"),
                            Ok(Err(e)) => tracing::warn!(error = %e, "tombstone cleanup failed"),
                            Err(e) => tracing::warn!(error = %e, "tombstone cleanup task panicked"),
                        }
                    }
                    _ = stop.notified() => {
                        break;
                    }
                }
            }
            tracing::debug!("cleanup cycle stopped");
        });

        Self { shutdown, handle }
    }

    /// Get a handle to stop this cycle.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Stop the cycle and wait for an in-flight pass to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
