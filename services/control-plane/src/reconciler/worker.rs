//! Reconcile and rebalance workers.
//!
//! The reconcile worker runs passes on a bounded pool. Work arrives from
//! two sources: explicit triggers (submit, update, delete, preemption,
//! requeues) and a periodic resync of every active workload. At most one
//! pass per workload is in flight; a trigger that arrives meanwhile reruns
//! the workload once the current pass finishes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kiln_id::WorkloadId;
use tokio::sync::{watch, Semaphore};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ReconcileError, ReconcileOutcome, ReconcileResult, Reconciler};
use crate::config::WorkerConfig;

/// Runs reconcile passes until shutdown is signaled.
pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    config: WorkerConfig,
}

#[derive(Default)]
struct Tracking {
    tasks: BTreeMap<Id, WorkloadId>,
    running: BTreeSet<WorkloadId>,
    /// Triggered while a pass was in flight.
    dirty: BTreeSet<WorkloadId>,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, config: WorkerConfig) -> Self {
        Self { reconciler, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut triggers) = self.reconciler.take_trigger_receiver() else {
            warn!("Trigger stream already taken, reconcile worker not started");
            return;
        };
        info!(
            workers = self.config.reconcile_workers,
            interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconcile worker"
        );

        let root = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.config.reconcile_workers.max(1)));
        let mut passes: JoinSet<ReconcileResult<ReconcileOutcome>> = JoinSet::new();
        let mut timers: JoinSet<()> = JoinSet::new();
        let mut tracking = Tracking::default();

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ids = self.reconciler.workload_ids_for_resync();
                    debug!(workloads = ids.len(), "Periodic resync");
                    for id in ids {
                        self.enqueue(id, &mut passes, &mut tracking, &permits, &root);
                    }
                }
                Some(id) = triggers.recv() => {
                    self.enqueue(id, &mut passes, &mut tracking, &permits, &root);
                }
                Some(joined) = passes.join_next_with_id() => {
                    let (task, result) = match joined {
                        Ok((task, result)) => (task, Some(result)),
                        Err(e) => {
                            error!(error = %e, "Reconcile pass panicked");
                            (e.id(), None)
                        }
                    };
                    let Some(id) = tracking.tasks.remove(&task) else {
                        continue;
                    };
                    tracking.running.remove(&id);
                    if let Some(result) = result {
                        self.finish(id, result, &mut timers);
                    }
                    if tracking.dirty.remove(&id) {
                        self.enqueue(id, &mut passes, &mut tracking, &permits, &root);
                    }
                }
                Some(_) = timers.join_next() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = passes.len(), "Reconcile worker shutting down");
        timers.abort_all();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while passes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = passes.len(),
                "Grace period elapsed, cancelling reconcile passes"
            );
            root.cancel();
            while passes.join_next().await.is_some() {}
        }
    }

    fn enqueue(
        &self,
        id: WorkloadId,
        passes: &mut JoinSet<ReconcileResult<ReconcileOutcome>>,
        tracking: &mut Tracking,
        permits: &Arc<Semaphore>,
        root: &CancellationToken,
    ) {
        if tracking.running.contains(&id) {
            tracking.dirty.insert(id);
            return;
        }

        let reconciler = Arc::clone(&self.reconciler);
        let permits = Arc::clone(permits);
        let cancel = root.child_token();
        let timeout = self.config.reconcile_timeout;

        let handle = passes.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return Err(ReconcileError::Cancelled);
            };
            let pass = reconciler.reconcile_workload(id, &cancel);
            tokio::pin!(pass);
            tokio::select! {
                result = &mut pass => result,
                _ = tokio::time::sleep(timeout) => {
                    warn!(workload_id = %id, "Reconcile pass timed out, cancelling");
                    cancel.cancel();
                    pass.await
                }
            }
        });
        tracking.tasks.insert(handle.id(), id);
        tracking.running.insert(id);
    }

    fn finish(
        &self,
        id: WorkloadId,
        result: ReconcileResult<ReconcileOutcome>,
        timers: &mut JoinSet<()>,
    ) {
        match result {
            Ok(ReconcileOutcome {
                requeue_after: Some(delay),
                ..
            }) => {
                let reconciler = Arc::clone(&self.reconciler);
                timers.spawn(async move {
                    tokio::time::sleep(delay.max(MIN_REQUEUE)).await;
                    reconciler.trigger(id);
                });
            }
            Ok(_) => {}
            Err(ReconcileError::Cancelled) => debug!(workload_id = %id, "Reconcile pass cancelled"),
            Err(ReconcileError::NotFound(_)) => debug!(workload_id = %id, "Workload vanished"),
            Err(e) => error!(workload_id = %id, error = %e, "Reconcile pass failed"),
        }
    }
}

/// Floor on requeue delays so an expired backoff cannot spin.
const MIN_REQUEUE: Duration = Duration::from_millis(100);

/// Periodically asks the resource manager for migrations.
///
/// Recommendations are always logged and emitted as events; they are only
/// handed to the reconciler when migrations are enabled.
pub struct RebalanceWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl RebalanceWorker {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let interval = reconciler.resources().config().rebalance_interval;
        Self {
            reconciler,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            execute = self.reconciler.migrations_enabled(),
            "Starting rebalance worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Let the first snapshots land before judging fragmentation
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Rebalance worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One rebalance evaluation. Returns how many migrations were queued.
    pub fn run_once(&self) -> usize {
        let pending = self.reconciler.pending_requests();
        let recommendations = self.reconciler.resources().rebalance(&pending);
        if recommendations.is_empty() || !self.reconciler.migrations_enabled() {
            return 0;
        }
        let queued = recommendations.len();
        info!(queued, "Queueing migrations");
        self.reconciler.enqueue_migrations(recommendations);
        queued
    }
}
