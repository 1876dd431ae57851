//! Snapshot refresh worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{ResourceError, ResourceManager};

/// Refreshes the cluster snapshot on a fixed interval.
pub struct SnapshotWorker {
    resources: Arc<ResourceManager>,
    interval: Duration,
}

impl SnapshotWorker {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        let interval = resources.config().refresh_interval;
        Self {
            resources,
            interval,
        }
    }

    /// Run until shutdown is signaled. The first refresh happens
    /// immediately so the snapshot leaves its initial stale state quickly.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting snapshot worker"
        );

        let cancel = CancellationToken::new();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.resources.refresh(&cancel).await {
                        Ok(()) | Err(ResourceError::Cancelled) => {}
                        Err(e) => warn!(error = %e, "Snapshot refresh failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        cancel.cancel();
                        info!("Snapshot worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
