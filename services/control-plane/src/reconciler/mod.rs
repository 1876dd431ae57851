//! Workload reconciler.
//!
//! The reconciler is responsible for:
//! - Accepting workload submissions, updates and deletions
//! - Observing instance health and replacing instances that keep failing
//! - Driving the replica count toward the scaling target
//! - Placing pending instances through the scheduler and starting them
//! - Carrying out preemption and, when enabled, migrations
//!
//! Reconciliation is level-triggered. Each pass compares the declared spec
//! with observed instance state and issues only the difference; a pass that
//! finds nothing to change starts or stops nothing and emits no events.
//!
//! Passes for one workload are serialized by its record lock. Passes for
//! different workloads run concurrently and meet only in the reservation
//! ledger.

mod error;
mod store;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_events::{
    AggregateType, EventPayload, InstanceCreatedPayload, InstancePhase,
    InstancePhaseChangedPayload, ScalingDecidedPayload, ScalingDirection, SchedulingFailedPayload,
    WorkloadDeletedPayload, WorkloadPhase, WorkloadPhaseChangedPayload, WorkloadSubmittedPayload,
    WorkloadUpdatedPayload,
};
use kiln_id::{InstanceId, WorkloadId};
use kiln_reconcile::{select_for_drain, DrainPriority, RetryTracker, SpecHash};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use error::{ReconcileError, ReconcileResult};
pub use store::{InstanceStatus, WorkloadFilter, WorkloadStatus};
pub use worker::{RebalanceWorker, ReconcileWorker};

use crate::collaborators::{
    call_with_deadline, CallError, HealthStatus, InstanceHealth, InstanceLaunch, RuntimeControl,
};
use crate::config::ReconcilerConfig;
use crate::events::EventRecorder;
use crate::registry::{ModelRegistry, RegistryError};
use crate::resources::{Hold, MigrationRecommendation, Reservation, ResourceManager};
use crate::scheduler::{Placement, PlacementRequest, PreemptionPlan, Scheduler, SchedulerError};
use crate::types::{MetricSamples, ResourceRequest, WorkloadSpec};
use store::{InstanceRecord, WorkloadRecord, WorkloadSlot, WorkloadStore};

/// Requeue delay while a workload is still moving toward its target.
const CONVERGING_REQUEUE: Duration = Duration::from_secs(2);

/// Failed instance records kept for status after they are replaced.
const FAILED_HISTORY: usize = 3;

/// What a reconcile pass left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: WorkloadPhase,
    /// When the workload should be looked at again, if before the next
    /// periodic resync.
    pub requeue_after: Option<Duration>,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    registry: Arc<ModelRegistry>,
    resources: Arc<ResourceManager>,
    scheduler: Arc<Scheduler>,
    runtime: Arc<dyn RuntimeControl>,
    events: Arc<EventRecorder>,
    store: WorkloadStore,
    trigger_tx: mpsc::UnboundedSender<WorkloadId>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkloadId>>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        registry: Arc<ModelRegistry>,
        resources: Arc<ResourceManager>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn RuntimeControl>,
        events: Arc<EventRecorder>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            resources,
            scheduler,
            runtime,
            events,
            store: WorkloadStore::default(),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn migrations_enabled(&self) -> bool {
        self.config.execute_migrations
    }

    // =========================================================================
    // Inbound operations
    // =========================================================================

    /// Records a new workload and schedules its first reconcile.
    ///
    /// The model must be registered; the reference taken here keeps it from
    /// being deleted while the workload exists.
    #[instrument(skip(self, spec), fields(name = %spec.name, model = %spec.model))]
    pub fn submit(&self, spec: WorkloadSpec) -> ReconcileResult<WorkloadId> {
        let (spec_hash, template_hash) = hashes(&spec)?;
        let id = WorkloadId::new();
        self.registry.acquire(&spec.model, id)?;

        let restarts = RetryTracker::new(self.config.max_restarts, self.config.restart_window);
        let record = WorkloadRecord::new(id, spec, spec_hash, template_hash, restarts);
        if let Err(record) = self.store.insert(record) {
            self.registry.release(&record.spec.model, id);
            return Err(ReconcileError::NameConflict(record.spec.name));
        }

        let Some(slot) = self.store.get(&id) else {
            return Err(ReconcileError::NotFound(id));
        };
        let status = slot.status();
        info!(workload_id = %id, "Workload submitted");
        self.events.emit(
            AggregateType::Workload,
            id.to_string(),
            EventPayload::WorkloadSubmitted(WorkloadSubmittedPayload {
                workload_id: id,
                name: status.name.clone(),
                model_name: status.model.name.clone(),
                model_version: status.model.version.clone(),
                qos: status.qos,
            }),
        );
        self.trigger(id);
        Ok(id)
    }

    /// Replaces a workload spec. Returns the resulting generation.
    ///
    /// An identical spec is a no-op. A failed workload moves back to
    /// `Pending` with its retry budget reset.
    #[instrument(skip(self, spec), fields(workload_id = %id))]
    pub async fn update(&self, id: WorkloadId, spec: WorkloadSpec) -> ReconcileResult<u64> {
        let slot = self.slot(&id)?;
        let mut guard = slot.record.lock().await;
        let w = &mut *guard;
        if w.deleted {
            return Err(ReconcileError::Terminating(id));
        }

        let (spec_hash, template_hash) = hashes(&spec)?;
        if spec_hash == w.spec_hash {
            return Ok(w.generation);
        }

        if !self.store.rename(id, &w.spec.name, &spec.name) {
            return Err(ReconcileError::NameConflict(spec.name));
        }
        if spec.model != w.spec.model {
            if let Err(e) = self.registry.acquire(&spec.model, id) {
                self.store.rename(id, &spec.name, &w.spec.name);
                return Err(e.into());
            }
            self.registry.release(&w.spec.model, id);
        }

        let template_changed = template_hash != w.template_hash;
        w.generation += 1;
        w.spec = spec;
        w.spec_hash = spec_hash;
        w.template_hash = template_hash;
        w.desired_replicas = w.spec.scaling.clamp(w.desired_replicas);
        w.infeasible_attempts = 0;
        w.next_schedule_at = None;
        w.last_error = None;
        w.updated_at = Utc::now();
        if w.phase == WorkloadPhase::Failed {
            self.set_phase(w, WorkloadPhase::Pending, Some("spec updated".to_string()));
        }

        info!(generation = w.generation, template_changed, "Workload updated");
        self.events.emit(
            AggregateType::Workload,
            id.to_string(),
            EventPayload::WorkloadUpdated(WorkloadUpdatedPayload {
                workload_id: id,
                generation: w.generation,
                spec_hash: w.spec_hash.to_string(),
            }),
        );
        slot.publish(w);
        let generation = w.generation;
        drop(guard);

        self.trigger(id);
        Ok(generation)
    }

    /// Marks a workload for deletion. Idempotent.
    ///
    /// Instances are torn down by the next reconcile; the name and the model
    /// reference are released once every instance has stopped.
    #[instrument(skip(self), fields(workload_id = %id))]
    pub async fn delete(&self, id: WorkloadId) -> ReconcileResult<()> {
        let slot = self.slot(&id)?;
        let mut guard = slot.record.lock().await;
        let w = &mut *guard;
        if w.deleted || w.phase == WorkloadPhase::Terminated {
            return Ok(());
        }

        w.deleted = true;
        self.set_phase(w, WorkloadPhase::Terminating, Some("deleted".to_string()));
        info!("Workload deletion requested");
        self.events.emit(
            AggregateType::Workload,
            id.to_string(),
            EventPayload::WorkloadDeleted(WorkloadDeletedPayload { workload_id: id }),
        );
        slot.publish(w);
        drop(guard);

        self.trigger(id);
        Ok(())
    }

    /// The last published status. Never waits on a pass in progress.
    pub fn status(&self, id: &WorkloadId) -> ReconcileResult<WorkloadStatus> {
        Ok(self.slot(id)?.status().as_ref().clone())
    }

    pub fn list(&self, filter: &WorkloadFilter) -> Vec<WorkloadStatus> {
        self.store
            .statuses()
            .into_iter()
            .filter(|s| filter.matches(s))
            .map(|s| s.as_ref().clone())
            .collect()
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Asks the reconcile worker to look at `id` soon.
    pub fn trigger(&self, id: WorkloadId) {
        if self.trigger_tx.send(id).is_err() {
            debug!(workload_id = %id, "Trigger dropped, no worker running");
        }
    }

    /// Hands the trigger stream to the worker. Only the first caller gets it.
    pub fn take_trigger_receiver(&self) -> Option<mpsc::UnboundedReceiver<WorkloadId>> {
        self.trigger_rx.lock().take()
    }

    /// Workloads the periodic resync should visit.
    pub fn workload_ids_for_resync(&self) -> Vec<WorkloadId> {
        self.store
            .statuses()
            .into_iter()
            .filter(|s| !matches!(s.phase, WorkloadPhase::Terminated | WorkloadPhase::Failed))
            .map(|s| s.workload_id)
            .collect()
    }

    /// Requests of every instance still awaiting placement.
    pub fn pending_requests(&self) -> Vec<ResourceRequest> {
        self.store
            .statuses()
            .into_iter()
            .filter(|s| s.phase != WorkloadPhase::Terminating)
            .flat_map(|s| {
                let pending = s.instances_in(InstancePhase::Pending).count();
                std::iter::repeat_n(s.resources, pending)
            })
            .collect()
    }

    /// Queues migrations for the owning workloads to carry out.
    pub fn enqueue_migrations(&self, recommendations: Vec<MigrationRecommendation>) {
        for rec in recommendations {
            let workload_id = rec.workload_id;
            self.store.enqueue_migration(rec);
            self.trigger(workload_id);
        }
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Runs one reconcile pass for `id`.
    ///
    /// Cancellation leaves the record consistent: an instance whose start
    /// was interrupted stays `Pending` and its provisional reservation is
    /// released.
    #[instrument(skip(self, cancel), fields(workload_id = %id))]
    pub async fn reconcile_workload(
        &self,
        id: WorkloadId,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ReconcileOutcome> {
        let slot = self.slot(&id)?;
        let mut guard = slot.record.lock().await;
        let result = self.reconcile_locked(&mut guard, cancel).await;
        slot.publish(&guard);
        result
    }

    async fn reconcile_locked(
        &self,
        w: &mut WorkloadRecord,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ReconcileOutcome> {
        if w.phase == WorkloadPhase::Terminated {
            return Ok(settled(w.phase));
        }
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        let now = Instant::now();

        if w.deleted {
            return self.reconcile_deletion(w, now, cancel).await;
        }
        if w.phase == WorkloadPhase::Failed {
            return Ok(settled(w.phase));
        }

        self.observe(w, cancel).await?;
        self.assess_sla(w);
        self.scale(w);
        self.apply_evictions(w);
        self.execute_migrations(w, now, cancel).await?;
        self.converge_replicas(w);
        self.place_pending(w, now, cancel).await?;
        if !w.has_pending_current() {
            self.release_hold(w);
        }
        self.drain_superseded(w);
        self.process_terminations(w, now, cancel).await?;

        let (phase, reason) = self.next_phase(w);
        match phase {
            WorkloadPhase::Running => w.last_error = None,
            WorkloadPhase::Failed => {
                w.last_error.clone_from(&reason);
                self.release_hold(w);
            }
            _ => {}
        }
        self.set_phase(w, phase, reason);
        w.observed_generation = w.generation;
        self.prune(w);

        Ok(ReconcileOutcome {
            phase: w.phase,
            requeue_after: requeue_after(w, now),
        })
    }

    /// Stops every instance, then releases the name and the model.
    async fn reconcile_deletion(
        &self,
        w: &mut WorkloadRecord,
        now: Instant,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ReconcileOutcome> {
        self.release_hold(w);
        let live: Vec<InstanceId> = w.live().map(|i| i.id).collect();
        for iid in live {
            self.begin_termination(w, iid, "workload deleted");
        }
        self.process_terminations(w, now, cancel).await?;

        let remaining = w
            .instances
            .values()
            .filter(|i| i.phase == InstancePhase::Terminating)
            .count();
        if remaining > 0 {
            debug!(remaining, "Waiting for instances to stop");
            return Ok(ReconcileOutcome {
                phase: w.phase,
                requeue_after: Some(requeue_after(w, now).unwrap_or(CONVERGING_REQUEUE)),
            });
        }

        self.set_phase(w, WorkloadPhase::Terminated, None);
        self.registry.release(&w.spec.model, w.id);
        self.store.release_name(w.id, &w.spec.name);
        self.store.take_evictions(&w.id);
        self.store.take_migrations(&w.id);
        self.resources.forget_workload(&w.id);
        w.observed_generation = w.generation;
        info!("Workload terminated");
        Ok(settled(w.phase))
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Polls health of started instances and reacts to failures.
    async fn observe(&self, w: &mut WorkloadRecord, cancel: &CancellationToken) -> ReconcileResult<()> {
        let snapshot = self.resources.snapshot();
        let started: Vec<InstanceId> = w
            .instances
            .values()
            .filter(|i| matches!(i.phase, InstancePhase::Starting | InstancePhase::Running))
            .map(|i| i.id)
            .collect();

        for iid in started {
            let node = w.instances.get(&iid).and_then(|i| i.node.clone());
            if !snapshot.stale && node.as_ref().is_some_and(|n| !snapshot.is_node_healthy(n)) {
                warn!(instance_id = %iid, node_id = ?node, "Instance lost with its node");
                self.fail_instance(w, iid, "node unhealthy".to_string(), cancel).await?;
                continue;
            }

            let health = match call_with_deadline(
                cancel,
                self.config.call_timeout,
                self.runtime.health_of(&iid),
            )
            .await
            {
                Ok(health) => health,
                Err(CallError::Cancelled) => return Err(ReconcileError::Cancelled),
                Err(e) => {
                    debug!(instance_id = %iid, error = %e, "Health check failed, keeping last known state");
                    continue;
                }
            };

            let status = health.status;
            self.record_health(w, iid, health);
            if status == HealthStatus::Unhealthy {
                self.handle_unhealthy(w, iid, cancel).await?;
            }
        }
        Ok(())
    }

    fn record_health(&self, w: &mut WorkloadRecord, iid: InstanceId, health: InstanceHealth) {
        let Some(inst) = w.instances.get_mut(&iid) else {
            return;
        };
        inst.health = health.status;
        inst.metrics = health.metrics;
        if health.status == HealthStatus::Healthy && inst.phase == InstancePhase::Starting {
            self.transition(w, iid, InstancePhase::Running, None);
        }
    }

    /// Restarts an unhealthy instance in place until its restart budget is
    /// spent, then fails it so a replacement is created.
    async fn handle_unhealthy(
        &self,
        w: &mut WorkloadRecord,
        iid: InstanceId,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        let Some(inst) = w.instances.get(&iid) else {
            return Ok(());
        };
        if !w.is_current(inst) {
            return self
                .fail_instance(w, iid, "unhealthy and superseded".to_string(), cancel)
                .await;
        }

        let now = Instant::now().into_std();
        if w.restarts.record_failure(&iid, now) {
            let reason = format!(
                "failing health checks after {} restarts",
                self.config.max_restarts
            );
            return self.fail_instance(w, iid, reason, cancel).await;
        }
        let attempt = w.restarts.failures(&iid, now);

        let Some(reservation) = w.instances.get(&iid).and_then(|i| i.reservation.clone()) else {
            return Ok(());
        };
        let launch = match self.launch_for(w, iid, &reservation) {
            Ok(launch) => launch,
            Err(e) => return self.fail_instance(w, iid, e.to_string(), cancel).await,
        };

        let timeout = self.config.call_timeout;
        let restarted = match call_with_deadline(cancel, timeout, self.runtime.stop_instance(&iid)).await {
            Ok(()) => {
                call_with_deadline(cancel, timeout, self.runtime.start_instance(&launch, &reservation.node))
                    .await
            }
            Err(e) => Err(e),
        };

        match restarted {
            Ok(()) => {
                warn!(instance_id = %iid, attempt, "Restarted unhealthy instance");
                if let Some(inst) = w.instances.get_mut(&iid) {
                    inst.health = HealthStatus::Unknown;
                    inst.reason = Some(format!(
                        "restarted after failed health check ({attempt}/{})",
                        self.config.max_restarts
                    ));
                }
                w.updated_at = Utc::now();
                Ok(())
            }
            Err(CallError::Cancelled) => Err(ReconcileError::Cancelled),
            Err(e) => {
                let reason = ReconcileError::RuntimeControl {
                    instance_id: iid,
                    reason: e.to_string(),
                };
                self.fail_instance(w, iid, reason.to_string(), cancel).await
            }
        }
    }

    /// Marks an instance failed and releases its reservation. A stop is
    /// attempted first; the instance is considered lost either way.
    async fn fail_instance(
        &self,
        w: &mut WorkloadRecord,
        iid: InstanceId,
        reason: String,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        match call_with_deadline(cancel, self.config.call_timeout, self.runtime.stop_instance(&iid)).await {
            Ok(()) => {}
            Err(CallError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => debug!(instance_id = %iid, error = %e, "Stop of failed instance did not complete"),
        }
        self.release(w, iid);
        w.restarts.clear(&iid);
        self.transition(w, iid, InstancePhase::Failed, Some(reason));
        Ok(())
    }

    fn assess_sla(&self, w: &mut WorkloadRecord) {
        let at_risk = w
            .observed_latency()
            .is_some_and(|latency| latency > w.spec.sla.max_latency_ms);
        if at_risk != w.sla_at_risk {
            if at_risk {
                warn!(
                    latency_ms = w.observed_latency(),
                    target_ms = w.spec.sla.max_latency_ms,
                    "Workload latency above SLA"
                );
            } else {
                info!("Workload latency back within SLA");
            }
            w.sla_at_risk = at_risk;
            w.updated_at = Utc::now();
        }
    }

    // =========================================================================
    // Replica management
    // =========================================================================

    fn scale(&self, w: &mut WorkloadRecord) {
        let samples: Vec<MetricSamples> = w
            .instances
            .values()
            .filter(|i| i.is_serving())
            .map(|i| i.metrics.clone())
            .collect();
        let decision =
            self.resources
                .evaluate_scaling(w.id, &w.spec.scaling, w.desired_replicas, &samples);

        let mut target = decision.target_replicas;
        if decision.direction == ScalingDirection::Down && w.sla_at_risk {
            debug!(reason = %decision.reason, "Holding scale-down while SLA is at risk");
            target = w.desired_replicas;
        }
        let target = w.spec.scaling.clamp(target);
        if target == w.desired_replicas {
            return;
        }

        let direction = if target > w.desired_replicas {
            ScalingDirection::Up
        } else {
            ScalingDirection::Down
        };
        info!(
            from = w.desired_replicas,
            to = target,
            reason = %decision.reason,
            "Replica target changed"
        );
        self.events.emit(
            AggregateType::Workload,
            w.id.to_string(),
            EventPayload::ScalingDecided(ScalingDecidedPayload {
                workload_id: w.id,
                current_replicas: w.desired_replicas,
                target_replicas: target,
                direction,
                reason: decision.reason,
            }),
        );
        w.desired_replicas = target;
        w.updated_at = Utc::now();
    }

    fn apply_evictions(&self, w: &mut WorkloadRecord) {
        for iid in self.store.take_evictions(&w.id) {
            if w.instances.get(&iid).is_some_and(|i| i.is_live()) {
                info!(instance_id = %iid, "Evicting instance for a higher QoS workload");
                self.begin_termination(w, iid, "preempted");
            }
        }
    }

    /// Creates or drains current-template instances to match the target.
    fn converge_replicas(&self, w: &mut WorkloadRecord) {
        let desired = w.desired_replicas as usize;
        let current: Vec<&InstanceRecord> = w.live().filter(|i| w.is_current(i)).collect();

        if current.len() < desired {
            let missing = desired - current.len();
            for _ in 0..missing {
                let iid = w.add_pending();
                debug!(instance_id = %iid, "Instance created");
                self.events.emit(
                    AggregateType::Instance,
                    iid.to_string(),
                    EventPayload::InstanceCreated(InstanceCreatedPayload {
                        instance_id: iid,
                        workload_id: w.id,
                    }),
                );
            }
            w.updated_at = Utc::now();
        } else if current.len() > desired {
            let excess = current.len() - desired;
            let victims: Vec<InstanceId> = select_for_drain(current, |i| drain_key(i))
                .into_iter()
                .take(excess)
                .map(|i| i.id)
                .collect();
            for iid in victims {
                self.begin_termination(w, iid, "scaled down");
            }
        }
    }

    /// Drains instances built from an older template, but only as far as
    /// ready current-template instances cover for them.
    fn drain_superseded(&self, w: &mut WorkloadRecord) {
        let superseded: Vec<&InstanceRecord> = w.live().filter(|i| !w.is_current(i)).collect();
        if superseded.is_empty() {
            return;
        }
        let ready_current = w
            .instances
            .values()
            .filter(|i| w.is_current(i) && i.is_serving())
            .count();
        let keep = (w.desired_replicas as usize).saturating_sub(ready_current);
        if superseded.len() <= keep {
            return;
        }

        let excess = superseded.len() - keep;
        let victims: Vec<InstanceId> = select_for_drain(superseded, |i| drain_key(i))
            .into_iter()
            .take(excess)
            .map(|i| i.id)
            .collect();
        let reason = format!("replaced by generation {}", w.generation);
        for iid in victims {
            self.begin_termination(w, iid, &reason);
        }
    }

    /// Moves an instance toward `Terminated`. Started instances keep their
    /// reservation until the runtime confirms the stop.
    fn begin_termination(&self, w: &mut WorkloadRecord, iid: InstanceId, reason: &str) {
        match w.instances.get(&iid).map(|i| i.phase) {
            Some(InstancePhase::Pending) => {
                self.transition(w, iid, InstancePhase::Terminated, Some(reason.to_string()));
            }
            Some(InstancePhase::Starting | InstancePhase::Running) => {
                self.transition(w, iid, InstancePhase::Terminating, Some(reason.to_string()));
            }
            _ => {}
        }
    }

    async fn process_terminations(
        &self,
        w: &mut WorkloadRecord,
        now: Instant,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        let stopping: Vec<InstanceId> = w
            .instances
            .values()
            .filter(|i| i.phase == InstancePhase::Terminating)
            .filter(|i| i.next_attempt_at.is_none_or(|t| t <= now))
            .map(|i| i.id)
            .collect();

        for iid in stopping {
            match call_with_deadline(cancel, self.config.call_timeout, self.runtime.stop_instance(&iid)).await {
                Ok(()) => {
                    self.release(w, iid);
                    w.restarts.clear(&iid);
                    self.transition(w, iid, InstancePhase::Terminated, None);
                }
                Err(CallError::Cancelled) => return Err(ReconcileError::Cancelled),
                Err(e) => self.runtime_failure(w, iid, e.to_string(), now),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Places pending current-template instances one at a time, in creation
    /// order. Stops at the first infeasible placement.
    async fn place_pending(
        &self,
        w: &mut WorkloadRecord,
        now: Instant,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        if w.next_schedule_at.is_some_and(|t| t > now) {
            return Ok(());
        }

        let mut pending: Vec<(u64, InstanceId)> = w
            .instances
            .values()
            .filter(|i| i.phase == InstancePhase::Pending && w.is_current(i))
            .filter(|i| i.next_attempt_at.is_none_or(|t| t <= now))
            .map(|i| (i.ordinal, i.id))
            .collect();
        pending.sort_unstable();

        for (_, iid) in pending {
            let request = PlacementRequest {
                instance_id: iid,
                workload_id: w.id,
                model: w.spec.model.clone(),
                request: w.spec.resources,
                qos: w.spec.qos,
            };
            match self.scheduler.schedule(&request, cancel) {
                Ok(placement) => {
                    w.infeasible_attempts = 0;
                    w.next_schedule_at = None;
                    // Reserving on the held node consumed the hold
                    if w.preemption_hold.as_ref() == Some(&placement.decision.node_id) {
                        w.preemption_hold = None;
                    }
                    self.realize(w, &request, placement, now, cancel).await?;
                }
                Err(SchedulerError::Infeasible { report, preemption }) => {
                    self.record_infeasible(w, &request, &report, now);
                    if let Some(plan) = preemption {
                        self.request_preemption(w, &request, plan, now);
                    }
                    break;
                }
                Err(SchedulerError::StaleSnapshot) => {
                    debug!("Placement deferred until the cluster snapshot is fresh");
                    break;
                }
                Err(e @ SchedulerError::CommitConflict { .. }) => {
                    debug!(error = %e, "Placement deferred after repeated commit conflicts");
                    break;
                }
                Err(SchedulerError::Cancelled) => return Err(ReconcileError::Cancelled),
            }
        }
        Ok(())
    }

    /// Starts a placed instance. The provisional reservation is confirmed
    /// only once the runtime accepts the start; every other exit releases it.
    async fn realize(
        &self,
        w: &mut WorkloadRecord,
        request: &PlacementRequest,
        placement: Placement,
        now: Instant,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        let iid = request.instance_id;
        let node = placement.decision.node_id.clone();
        let launch = match self.launch_for(w, iid, placement.reservation.reservation()) {
            Ok(launch) => launch,
            Err(e) => {
                self.runtime_failure(w, iid, e.to_string(), now);
                return Ok(());
            }
        };

        match self.registry.ensure_cached(&request.model, &node, cancel).await {
            Ok(true) => debug!(node_id = %node, "Model transfer triggered ahead of start"),
            Ok(false) => {}
            Err(RegistryError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => warn!(node_id = %node, error = %e, "Model prefetch failed, starting cold"),
        }

        match call_with_deadline(
            cancel,
            self.config.call_timeout,
            self.runtime.start_instance(&launch, &node),
        )
        .await
        {
            Ok(()) => {
                let reservation = placement.reservation.confirm();
                if let Some(inst) = w.instances.get_mut(&iid) {
                    inst.node = Some(node);
                    inst.reservation = Some(reservation);
                    inst.runtime_failures = 0;
                    inst.next_attempt_at = None;
                }
                self.transition(w, iid, InstancePhase::Starting, None);
                self.probe(w, iid, cancel).await
            }
            Err(CallError::Cancelled) => {
                self.stop_unconfirmed(iid).await;
                Err(ReconcileError::Cancelled)
            }
            Err(e) => {
                if matches!(e, CallError::TimedOut(_)) {
                    self.stop_unconfirmed(iid).await;
                }
                self.runtime_failure(w, iid, e.to_string(), now);
                Ok(())
            }
        }
    }

    /// Checks a just-started instance so a fast boot reaches `Running` in
    /// the same pass.
    async fn probe(
        &self,
        w: &mut WorkloadRecord,
        iid: InstanceId,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        match call_with_deadline(cancel, self.config.call_timeout, self.runtime.health_of(&iid)).await {
            Ok(health) => {
                self.record_health(w, iid, health);
                Ok(())
            }
            Err(CallError::Cancelled) => Err(ReconcileError::Cancelled),
            Err(e) => {
                debug!(instance_id = %iid, error = %e, "Post-start health check failed");
                Ok(())
            }
        }
    }

    fn launch_for(
        &self,
        w: &WorkloadRecord,
        iid: InstanceId,
        reservation: &Reservation,
    ) -> ReconcileResult<InstanceLaunch> {
        let entry = self.registry.lookup(&w.spec.model)?;
        Ok(InstanceLaunch {
            instance_id: iid,
            workload_id: w.id,
            model: w.spec.model.clone(),
            artifact_location: entry.location,
            resources: w.spec.resources,
            gpu_devices: reservation.gpu_devices(),
        })
    }

    fn record_infeasible(
        &self,
        w: &mut WorkloadRecord,
        request: &PlacementRequest,
        report: &crate::scheduler::InfeasibilityReport,
        now: Instant,
    ) {
        w.infeasible_attempts += 1;
        let delay = self
            .config
            .infeasible_backoff
            .delay(w.infeasible_attempts.saturating_sub(1));
        w.next_schedule_at = Some(now + delay);

        let reason = format!("Infeasible: {report}");
        let template_hash = w.template_hash.clone();
        for inst in w.instances.values_mut() {
            if inst.phase == InstancePhase::Pending && inst.template_hash == template_hash {
                inst.reason = Some(reason.clone());
            }
        }

        warn!(
            attempt = w.infeasible_attempts,
            retry_in = ?delay,
            report = %report,
            "No feasible node for instance"
        );
        self.events.emit(
            AggregateType::Instance,
            request.instance_id.to_string(),
            EventPayload::SchedulingFailed(SchedulingFailedPayload {
                instance_id: request.instance_id,
                workload_id: w.id,
                constraints: report.constraints(),
                attempt: w.infeasible_attempts,
                message: report.to_string(),
            }),
        );
        w.last_error = Some(reason);
        w.updated_at = Utc::now();
    }

    /// Holds the freed capacity for `w` and asks the owners of the victims
    /// to evict them. The preempting workload places on a later pass, once
    /// the stops are confirmed.
    fn request_preemption(
        &self,
        w: &mut WorkloadRecord,
        request: &PlacementRequest,
        plan: PreemptionPlan,
        now: Instant,
    ) {
        info!(node_id = %plan.node, victims = plan.victims.len(), "Requesting preemption");
        if w.preemption_hold.as_ref().is_some_and(|held| held != &plan.node) {
            self.release_hold(w);
        }
        let hold = Hold {
            workload_id: w.id,
            request: request.request,
            expires_at: now + self.config.preemption_hold,
        };
        match self.resources.ledger().hold(&plan.node, hold) {
            Ok(()) => w.preemption_hold = Some(plan.node.clone()),
            Err(e) => warn!(node_id = %plan.node, error = %e, "Could not hold capacity for preemption"),
        }

        for victim in plan.victims {
            self.store.request_eviction(victim.workload_id, victim.instance_id);
            self.trigger(victim.workload_id);
        }
    }

    fn release_hold(&self, w: &mut WorkloadRecord) {
        if let Some(node) = w.preemption_hold.take() {
            if self.resources.ledger().release_hold(&node, &w.id).is_some() {
                debug!(node_id = %node, "Preemption hold released");
            }
        }
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Carries out at most one queued migration: start a replacement on the
    /// target node, then drain the source once the replacement serves.
    async fn execute_migrations(
        &self,
        w: &mut WorkloadRecord,
        now: Instant,
        cancel: &CancellationToken,
    ) -> ReconcileResult<()> {
        let queued = self.store.take_migrations(&w.id);
        if queued.is_empty() || !self.config.execute_migrations {
            return Ok(());
        }

        let ready = w.instances.values().filter(|i| i.is_serving()).count();
        let min = w.spec.scaling.min_replicas as usize;
        if w.phase != WorkloadPhase::Running || w.sla_at_risk || ready <= min {
            debug!(ready, min, phase = %w.phase, "Skipping migration");
            return Ok(());
        }

        let Some(rec) = queued.into_iter().find(|rec| {
            w.instances.get(&rec.instance_id).is_some_and(|i| {
                i.phase == InstancePhase::Running && i.node.as_ref() == Some(&rec.from_node)
            })
        }) else {
            return Ok(());
        };

        let replacement = w.add_pending();
        self.events.emit(
            AggregateType::Instance,
            replacement.to_string(),
            EventPayload::InstanceCreated(InstanceCreatedPayload {
                instance_id: replacement,
                workload_id: w.id,
            }),
        );
        let request = PlacementRequest {
            instance_id: replacement,
            workload_id: w.id,
            model: w.spec.model.clone(),
            request: w.spec.resources,
            qos: w.spec.qos,
        };

        match self.scheduler.schedule_pinned(&request, &rec.to_node, cancel) {
            Ok(placement) => {
                self.realize(w, &request, placement, now, cancel).await?;
                if w.instances.get(&replacement).is_some_and(|i| i.is_serving()) {
                    info!(
                        instance_id = %rec.instance_id,
                        from = %rec.from_node,
                        to = %rec.to_node,
                        "Instance migrated"
                    );
                    self.begin_termination(w, rec.instance_id, &format!("migrated to {}", rec.to_node));
                }
            }
            Err(SchedulerError::Cancelled) => {
                self.begin_termination(w, replacement, "migration cancelled");
                return Err(ReconcileError::Cancelled);
            }
            Err(e) => {
                debug!(error = %e, to = %rec.to_node, "Migration target unavailable");
                self.begin_termination(w, replacement, "migration target unavailable");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn slot(&self, id: &WorkloadId) -> ReconcileResult<Arc<WorkloadSlot>> {
        self.store.get(id).ok_or(ReconcileError::NotFound(*id))
    }

    fn release(&self, w: &mut WorkloadRecord, iid: InstanceId) {
        if let Some(reservation) = w.instances.get_mut(&iid).and_then(|i| i.reservation.take()) {
            self.resources.release_reservation(&reservation.node, &iid);
        }
    }

    /// Applies an instance phase change if the lifecycle allows it.
    fn transition(
        &self,
        w: &mut WorkloadRecord,
        iid: InstanceId,
        next: InstancePhase,
        reason: Option<String>,
    ) -> bool {
        let workload_id = w.id;
        let Some(inst) = w.instances.get_mut(&iid) else {
            return false;
        };
        if !inst.phase.can_transition_to(next) {
            warn!(instance_id = %iid, from = %inst.phase, to = %next, "Refusing instance transition");
            return false;
        }

        let old = std::mem::replace(&mut inst.phase, next);
        let now = Utc::now();
        inst.transitioned_at = now;
        if next == InstancePhase::Running {
            inst.ready_at = Some(now);
            inst.reason = None;
        }
        if reason.is_some() {
            inst.reason.clone_from(&reason);
        }
        if next == InstancePhase::Pending {
            inst.node = None;
        }

        debug!(instance_id = %iid, from = %old, to = %next, "Instance phase changed");
        self.events.emit(
            AggregateType::Instance,
            iid.to_string(),
            EventPayload::InstancePhaseChanged(InstancePhaseChangedPayload {
                instance_id: iid,
                workload_id,
                old_phase: old,
                new_phase: next,
                node_id: inst.node.clone(),
                reason,
            }),
        );
        w.updated_at = now;
        true
    }

    fn set_phase(&self, w: &mut WorkloadRecord, next: WorkloadPhase, reason: Option<String>) {
        if w.phase == next {
            return;
        }
        if !w.phase.can_transition_to(next) {
            warn!(workload_id = %w.id, from = %w.phase, to = %next, "Refusing workload transition");
            return;
        }

        let old = std::mem::replace(&mut w.phase, next);
        w.updated_at = Utc::now();
        info!(workload_id = %w.id, from = %old, to = %next, "Workload phase changed");
        self.events.emit(
            AggregateType::Workload,
            w.id.to_string(),
            EventPayload::WorkloadPhaseChanged(WorkloadPhaseChangedPayload {
                workload_id: w.id,
                old_phase: old,
                new_phase: next,
                reason,
            }),
        );
    }

    /// Backs off further start or stop attempts for one instance.
    fn runtime_failure(&self, w: &mut WorkloadRecord, iid: InstanceId, reason: String, now: Instant) {
        let reason = ReconcileError::RuntimeControl {
            instance_id: iid,
            reason,
        }
        .to_string();
        let Some(inst) = w.instances.get_mut(&iid) else {
            return;
        };
        let delay = self.config.runtime_backoff.delay(inst.runtime_failures);
        inst.runtime_failures += 1;
        inst.next_attempt_at = Some(now + delay);
        inst.reason = Some(reason.clone());
        warn!(
            instance_id = %iid,
            failures = inst.runtime_failures,
            retry_in = ?delay,
            error = %reason,
            "Runtime call failed"
        );
        w.last_error = Some(reason);
        w.updated_at = Utc::now();
    }

    /// Best-effort stop for an instance whose start outcome is unknown.
    /// Runs to completion even when the pass is cancelled, so a later start
    /// of the same instance cannot race it.
    async fn stop_unconfirmed(&self, iid: InstanceId) {
        match tokio::time::timeout(self.config.call_timeout, self.runtime.stop_instance(&iid)).await {
            Ok(Ok(())) => debug!(instance_id = %iid, "Stopped instance with unknown start outcome"),
            Ok(Err(e)) => warn!(instance_id = %iid, error = %e, "Cleanup stop failed"),
            Err(_) => warn!(instance_id = %iid, "Cleanup stop timed out"),
        }
    }

    fn next_phase(&self, w: &WorkloadRecord) -> (WorkloadPhase, Option<String>) {
        let mut pending = 0;
        let mut starting = 0;
        let mut terminating = 0;
        let mut unhealthy = 0;
        let mut ready = 0;
        let mut current = 0;
        let mut superseded = 0;
        for inst in w.instances.values() {
            match inst.phase {
                InstancePhase::Pending => pending += 1,
                InstancePhase::Starting => starting += 1,
                InstancePhase::Terminating => terminating += 1,
                InstancePhase::Running if inst.health == HealthStatus::Unhealthy => unhealthy += 1,
                InstancePhase::Running => ready += 1,
                _ => {}
            }
            if inst.is_live() {
                if w.is_current(inst) {
                    current += 1;
                } else {
                    superseded += 1;
                }
            }
        }

        let min = w.spec.scaling.min_replicas as usize;
        if w.infeasible_attempts >= self.config.max_infeasible_attempts && ready < min {
            let reason = ReconcileError::ConvergenceFailure {
                workload_id: w.id,
                reason: w
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "placement attempts exhausted".to_string()),
            };
            return (WorkloadPhase::Failed, Some(reason.to_string()));
        }
        if pending > 0 {
            return (WorkloadPhase::Scheduling, None);
        }
        if unhealthy > 0 {
            return (
                WorkloadPhase::Degraded,
                Some(format!("{unhealthy} instance(s) failing health checks")),
            );
        }
        if current != w.desired_replicas as usize || superseded > 0 || terminating > 0 || starting > 0 {
            return (WorkloadPhase::Scaling, None);
        }
        (WorkloadPhase::Running, None)
    }

    /// Drops terminated instance records and all but the newest failed ones.
    fn prune(&self, w: &mut WorkloadRecord) {
        w.instances.retain(|_, i| i.phase != InstancePhase::Terminated);

        let mut failed: Vec<(u64, InstanceId)> = w
            .instances
            .values()
            .filter(|i| i.phase == InstancePhase::Failed)
            .map(|i| (i.ordinal, i.id))
            .collect();
        if failed.len() > FAILED_HISTORY {
            failed.sort_unstable_by(|a, b| b.cmp(a));
            for (_, iid) in failed.into_iter().skip(FAILED_HISTORY) {
                w.instances.remove(&iid);
            }
        }
        w.restarts.prune(Instant::now().into_std());
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn hashes(spec: &WorkloadSpec) -> ReconcileResult<(SpecHash, SpecHash)> {
    Ok((SpecHash::of(spec)?, SpecHash::of(&spec.template())?))
}

fn settled(phase: WorkloadPhase) -> ReconcileOutcome {
    ReconcileOutcome {
        phase,
        requeue_after: None,
    }
}

/// Placed-but-unstarted first, then unhealthy, then the least recently
/// ready, then creation order.
fn drain_key(inst: &InstanceRecord) -> (DrainPriority, Option<DateTime<Utc>>, u64) {
    let priority = match inst.phase {
        InstancePhase::Pending => DrainPriority::Unplaced,
        InstancePhase::Starting => DrainPriority::Starting,
        _ if inst.health == HealthStatus::Unhealthy => DrainPriority::Unhealthy,
        _ => DrainPriority::Ready,
    };
    (priority, inst.ready_at, inst.ordinal)
}

fn requeue_after(w: &WorkloadRecord, now: Instant) -> Option<Duration> {
    if matches!(w.phase, WorkloadPhase::Failed | WorkloadPhase::Terminated) {
        return None;
    }
    let backoff = w
        .instances
        .values()
        .filter(|i| i.phase.is_active())
        .filter_map(|i| i.next_attempt_at)
        .chain(w.next_schedule_at)
        .min();
    if let Some(at) = backoff {
        return Some(at.saturating_duration_since(now));
    }
    match w.phase {
        WorkloadPhase::Running | WorkloadPhase::Pending => None,
        _ => Some(CONVERGING_REQUEUE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NodeInfo;
    use crate::config::{
        PreemptionMode, RegistryConfig, ResourceManagerConfig, SchedulerConfig,
    };
    use crate::dev::{
        FixedBenchmarkRunner, InMemoryStorage, MockRuntime, RecordingEventSink, StaticCluster,
    };
    use crate::types::fixtures::{spec, GIB};
    use crate::types::{MetricKind, ModelRef, NodeCapacity, ScalingPolicy};
    use kiln_id::NodeId;
    use kiln_reconcile::{BackoffPolicy, ConvergenceStatus};

    struct Harness {
        cluster: Arc<StaticCluster>,
        runtime: Arc<MockRuntime>,
        resources: Arc<ResourceManager>,
        registry: Arc<ModelRegistry>,
        sink: Arc<RecordingEventSink>,
        reconciler: Reconciler,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn new(nodes: Vec<NodeInfo>) -> Self {
            Self::with(nodes, ReconcilerConfig::default(), PreemptionMode::Disabled).await
        }

        async fn with(nodes: Vec<NodeInfo>, config: ReconcilerConfig, preemption: PreemptionMode) -> Self {
            let cancel = CancellationToken::new();
            let sink = Arc::new(RecordingEventSink::default());
            let events = Arc::new(EventRecorder::new(sink.clone()));

            let storage = InMemoryStorage::new();
            let checksum = storage.put("s3://models/llama2-v2", b"llama2 weights");
            let registry = Arc::new(ModelRegistry::new(
                RegistryConfig::default(),
                Arc::new(storage),
                Arc::new(FixedBenchmarkRunner::default()),
                events.clone(),
            ));
            registry
                .register("llama2", "v2", "s3://models/llama2-v2", &checksum, &cancel)
                .await
                .unwrap();

            let cluster = Arc::new(StaticCluster::new(nodes));
            let resources = Arc::new(
                ResourceManager::new(
                    ResourceManagerConfig {
                        scale_down_cooldown: 2,
                        ..ResourceManagerConfig::default()
                    },
                    cluster.clone(),
                    events.clone(),
                )
                .with_heartbeat(registry.clone()),
            );
            resources.refresh(&cancel).await.unwrap();

            let scheduler = Arc::new(Scheduler::new(
                SchedulerConfig {
                    preemption,
                    ..SchedulerConfig::default()
                },
                resources.clone(),
                registry.clone(),
                events.clone(),
            ));
            let runtime = Arc::new(MockRuntime::new());
            let reconciler = Reconciler::new(
                config,
                registry.clone(),
                resources.clone(),
                scheduler,
                runtime.clone(),
                events,
            );

            Self {
                cluster,
                runtime,
                resources,
                registry,
                sink,
                reconciler,
                cancel,
            }
        }

        async fn reconcile(&self, id: WorkloadId) -> ReconcileOutcome {
            self.reconciler.reconcile_workload(id, &self.cancel).await.unwrap()
        }

        fn status(&self, id: WorkloadId) -> WorkloadStatus {
            self.reconciler.status(&id).unwrap()
        }

        fn allocated_cpu(&self, node: &str) -> u64 {
            self.resources
                .ledger()
                .allocation(&node_id(node))
                .map_or(0, |a| a.cpu_millis)
        }
    }

    fn node_id(name: &str) -> NodeId {
        NodeId::parse(name).unwrap()
    }

    fn cpu_node(name: &str, cpu_millis: u64) -> NodeInfo {
        NodeInfo::new(
            node_id(name),
            NodeCapacity {
                cpu_millis,
                memory_bytes: 64 * GIB,
                gpu_count: 0,
                gpu_memory_bytes: 0,
            },
        )
    }

    fn fixed(name: &str, replicas: u32, cpu_millis: u64) -> WorkloadSpec {
        let mut s = spec(name);
        s.scaling = ScalingPolicy::fixed(replicas);
        s.resources = ResourceRequest::cpu(cpu_millis, 4 * GIB);
        s
    }

    fn cpu_samples(value: f64) -> MetricSamples {
        MetricSamples::from([(MetricKind::CpuUtilization, value)])
    }

    #[tokio::test]
    async fn test_submit_converges_to_running() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(spec("chat")).unwrap();

        let status = h.status(id);
        assert_eq!(status.phase, WorkloadPhase::Pending);
        assert_eq!(status.convergence, ConvergenceStatus::Unknown);

        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Running);
        assert_eq!(outcome.requeue_after, None);

        let status = h.status(id);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.observed_generation, 1);
        assert_eq!(status.convergence, ConvergenceStatus::Converged);
        assert_eq!(status.instances[0].node_id, Some(node_id("node-a")));
        assert_eq!(h.runtime.running_instances().len(), 1);
        assert_eq!(h.allocated_cpu("node-a"), 2_000);

        for event in [
            "workload.submitted",
            "instance.created",
            "scheduling.decided",
            "instance.phase_changed",
            "workload.phase_changed",
        ] {
            assert!(h.sink.count(event) > 0, "missing {event}");
        }
    }

    #[tokio::test]
    async fn test_converged_pass_changes_nothing() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 2, 2_000)).unwrap();
        h.reconcile(id).await;
        let starts = h.runtime.start_count();
        let before = h.status(id);
        h.sink.clear();

        h.reconcile(id).await;

        assert!(h.sink.events().is_empty());
        assert_eq!(h.runtime.start_count(), starts);
        assert!(h.runtime.stopped_instances().is_empty());
        assert_eq!(h.status(id).instances, before.instances);
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        h.reconciler.submit(spec("chat")).unwrap();

        let err = h.reconciler.submit(spec("chat")).unwrap_err();
        assert!(matches!(err, ReconcileError::NameConflict(name) if name == "chat"));

        let mut unknown = spec("other");
        unknown.model = ModelRef::new("mistral", "v1");
        let err = h.reconciler.submit(unknown).unwrap_err();
        assert!(matches!(err, ReconcileError::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_backs_off_per_instance() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 2, 2_000)).unwrap();
        h.runtime.fail_next_starts(1);

        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Scheduling);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
        let status = h.status(id);
        assert_eq!(status.ready_replicas, 1);
        let pending = status
            .instances
            .iter()
            .find(|i| i.phase == InstancePhase::Pending)
            .unwrap();
        assert!(pending.reason.as_deref().unwrap().contains("runtime control failed"));
        assert_eq!(pending.node_id, None);
        // The failed start released its provisional reservation
        assert_eq!(h.allocated_cpu("node-a"), 2_000);

        // Still backing off
        h.reconcile(id).await;
        assert_eq!(h.runtime.start_count(), 2);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Running);
        assert_eq!(h.status(id).ready_replicas, 2);
        assert_eq!(h.allocated_cpu("node-a"), 4_000);
    }

    #[tokio::test]
    async fn test_unhealthy_instance_restarts_then_is_replaced() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 1, 2_000)).unwrap();
        h.reconcile(id).await;
        let original = h.status(id).instances[0].instance_id;
        h.runtime.set_unhealthy(original, true);

        for attempt in 1..=3 {
            h.reconcile(id).await;
            let status = h.status(id);
            assert_eq!(status.instances.len(), 1);
            assert_eq!(status.instances[0].instance_id, original);
            assert_eq!(h.runtime.stopped_instances().len(), attempt);
        }

        h.reconcile(id).await;
        let status = h.status(id);
        assert_eq!(status.phase, WorkloadPhase::Running);
        assert_eq!(status.ready_replicas, 1);
        let failed = status.instances.iter().find(|i| i.instance_id == original).unwrap();
        assert_eq!(failed.phase, InstancePhase::Failed);
        assert!(status
            .instances
            .iter()
            .any(|i| i.instance_id != original && i.phase == InstancePhase::Running));
        // Only the replacement holds a reservation
        assert_eq!(h.allocated_cpu("node-a"), 2_000);
    }

    #[tokio::test]
    async fn test_scale_down_waits_for_cooldown() {
        let h = Harness::new(vec![cpu_node("node-a", 16_000)]).await;
        let id = h.reconciler.submit(spec("chat")).unwrap();
        h.runtime.set_workload_metrics(id, cpu_samples(0.95));

        h.reconcile(id).await;
        h.reconcile(id).await;
        assert_eq!(h.status(id).desired_replicas, 2);
        assert_eq!(h.status(id).ready_replicas, 2);

        h.runtime.set_workload_metrics(id, cpu_samples(0.1));
        h.reconcile(id).await;
        assert_eq!(h.status(id).desired_replicas, 2);

        h.reconcile(id).await;
        let status = h.status(id);
        assert_eq!(status.desired_replicas, 1);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(h.runtime.running_instances().len(), 1);
        assert_eq!(h.sink.count("scaling.decided"), 2);
        assert_eq!(h.allocated_cpu("node-a"), 2_000);
    }

    #[tokio::test]
    async fn test_scale_down_held_while_sla_at_risk() {
        let h = Harness::new(vec![cpu_node("node-a", 16_000)]).await;
        let mut s = spec("chat");
        s.scaling.min_replicas = 2;
        let id = h.reconciler.submit(s.clone()).unwrap();
        h.reconcile(id).await;

        s.scaling.min_replicas = 1;
        h.reconciler.update(id, s).await.unwrap();
        h.runtime.set_workload_metrics(
            id,
            MetricSamples::from([(MetricKind::CpuUtilization, 0.1), (MetricKind::LatencyMs, 5_000.0)]),
        );
        for _ in 0..4 {
            h.reconcile(id).await;
        }
        let status = h.status(id);
        assert!(status.sla_at_risk);
        assert_eq!(status.desired_replicas, 2);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_releases_model() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 2, 2_000)).unwrap();
        h.reconcile(id).await;

        let model = ModelRef::new("llama2", "v2");
        assert!(matches!(
            h.registry.delete(&model),
            Err(RegistryError::InUse { workloads: 1, .. })
        ));

        h.reconciler.delete(id).await.unwrap();
        h.reconciler.delete(id).await.unwrap();
        assert_eq!(h.status(id).phase, WorkloadPhase::Terminating);
        assert!(matches!(
            h.reconciler.update(id, spec("chat")).await,
            Err(ReconcileError::Terminating(_))
        ));

        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Terminated);
        assert!(h.runtime.running_instances().is_empty());
        assert_eq!(h.allocated_cpu("node-a"), 0);
        assert_eq!(h.sink.count("workload.deleted"), 1);

        // The name is free again and the model can go
        let again = h.reconciler.submit(spec("chat")).unwrap();
        assert_ne!(again, id);
        h.reconciler.delete(again).await.unwrap();
        h.reconcile(again).await;
        h.registry.delete(&model).unwrap();
    }

    #[tokio::test]
    async fn test_node_outage_replaces_instances() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000), cpu_node("node-b", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 2, 2_000)).unwrap();
        h.reconcile(id).await;
        assert_eq!(h.runtime.running_on(&node_id("node-a")).len(), 2);

        h.cluster.set_ready(&node_id("node-a"), false);
        h.resources.refresh(&h.cancel).await.unwrap();
        h.reconcile(id).await;

        let status = h.status(id);
        assert_eq!(status.phase, WorkloadPhase::Running);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.instances_in(InstancePhase::Failed).count(), 2);
        assert_eq!(h.runtime.running_on(&node_id("node-b")).len(), 2);
        assert_eq!(h.allocated_cpu("node-a"), 0);
        assert_eq!(h.allocated_cpu("node-b"), 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infeasible_workload_fails_then_recovers_on_update() {
        let config = ReconcilerConfig {
            max_infeasible_attempts: 2,
            infeasible_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(1)),
            ..ReconcilerConfig::default()
        };
        let h = Harness::with(vec![cpu_node("node-a", 4_000)], config, PreemptionMode::Disabled).await;
        let id = h.reconciler.submit(fixed("chat", 1, 8_000)).unwrap();

        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Scheduling);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));
        let status = h.status(id);
        assert!(status.last_error.as_deref().unwrap().contains("insufficient cpu"));
        assert!(status.instances[0].reason.as_deref().unwrap().starts_with("Infeasible"));
        assert_eq!(h.sink.count("scheduling.failed"), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Failed);
        assert_eq!(h.status(id).convergence, ConvergenceStatus::Diverged);

        // Failed workloads are left alone
        h.reconcile(id).await;
        assert_eq!(h.sink.count("scheduling.failed"), 2);

        let generation = h.reconciler.update(id, fixed("chat", 1, 2_000)).await.unwrap();
        assert_eq!(generation, 2);
        assert_eq!(h.status(id).phase, WorkloadPhase::Pending);

        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Running);
        let status = h.status(id);
        assert_eq!(status.observed_generation, 2);
        assert_eq!(status.last_error, None);
        assert_eq!(status.current_replicas, 1);
    }

    #[tokio::test]
    async fn test_template_change_replaces_surge_first() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(fixed("chat", 2, 2_000)).unwrap();
        h.reconcile(id).await;
        let old: Vec<_> = h.status(id).instances.iter().map(|i| i.instance_id).collect();

        h.reconciler.update(id, fixed("chat", 2, 1_000)).await.unwrap();
        let outcome = h.reconcile(id).await;
        assert_eq!(outcome.phase, WorkloadPhase::Running);

        let status = h.status(id);
        assert_eq!(status.ready_replicas, 2);
        assert!(status.instances.iter().all(|i| !old.contains(&i.instance_id)));
        assert_eq!(h.runtime.start_count(), 4);
        let mut stopped = h.runtime.stopped_instances();
        stopped.sort();
        let mut expected = old.clone();
        expected.sort();
        assert_eq!(stopped, expected);
        assert_eq!(h.allocated_cpu("node-a"), 2_000);
    }

    #[tokio::test]
    async fn test_rename_and_identical_update() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(spec("chat")).unwrap();
        h.reconciler.submit(spec("taken")).unwrap();

        assert_eq!(h.reconciler.update(id, spec("chat")).await.unwrap(), 1);
        assert!(matches!(
            h.reconciler.update(id, spec("taken")).await,
            Err(ReconcileError::NameConflict(_))
        ));
        let status = h.status(id);
        let created_at = status.created_at;
        assert!(created_at <= status.updated_at);
        assert_eq!(h.reconciler.update(id, spec("chat-v2")).await.unwrap(), 2);
        assert_eq!(h.status(id).name, "chat-v2");
        assert_eq!(h.status(id).created_at, created_at);
        h.reconciler.submit(spec("chat")).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_premium_preempts_basic() {
        let h = Harness::with(
            vec![cpu_node("node-a", 4_000)],
            ReconcilerConfig::default(),
            PreemptionMode::LowestQosFirst,
        )
        .await;
        let mut basic = fixed("batch", 1, 4_000);
        basic.qos = kiln_events::QosClass::Basic;
        let basic = h.reconciler.submit(basic).unwrap();
        h.reconcile(basic).await;
        let victim = h.status(basic).instances[0].instance_id;

        let mut premium = fixed("chat", 1, 2_000);
        premium.qos = kiln_events::QosClass::Premium;
        let premium = h.reconciler.submit(premium).unwrap();
        assert_eq!(h.reconcile(premium).await.phase, WorkloadPhase::Scheduling);

        // The victim's owner evicts it
        h.reconcile(basic).await;
        assert!(h.runtime.stopped_instances().contains(&victim));
        assert_eq!(h.allocated_cpu("node-a"), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(h.reconcile(premium).await.phase, WorkloadPhase::Running);
        assert_eq!(h.allocated_cpu("node-a"), 2_000);

        // The evicted workload cannot fit back
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(h.reconcile(basic).await.phase, WorkloadPhase::Scheduling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_workload_cannot_retake_held_capacity() {
        let h = Harness::with(
            vec![cpu_node("node-a", 4_000)],
            ReconcilerConfig::default(),
            PreemptionMode::LowestQosFirst,
        )
        .await;
        let mut basic = fixed("batch", 1, 4_000);
        basic.qos = kiln_events::QosClass::Basic;
        let basic = h.reconciler.submit(basic).unwrap();
        h.reconcile(basic).await;

        let mut premium = fixed("chat", 1, 2_000);
        premium.qos = kiln_events::QosClass::Premium;
        let premium = h.reconciler.submit(premium).unwrap();
        h.reconcile(premium).await;
        h.reconcile(basic).await;
        assert_eq!(h.runtime.stopped_instances().len(), 1);

        // The evicted workload's replacement goes first once its backoff ends
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(h.reconcile(basic).await.phase, WorkloadPhase::Scheduling);
        assert_eq!(h.allocated_cpu("node-a"), 0);

        assert_eq!(h.reconcile(premium).await.phase, WorkloadPhase::Running);
        assert_eq!(h.allocated_cpu("node-a"), 2_000);
        let held: usize = h
            .resources
            .ledger()
            .view(&node_id("node-a"), |l| l.holds().count())
            .unwrap();
        assert_eq!(held, 0);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(600)).await;
            h.reconcile(basic).await;
            h.reconcile(premium).await;
        }
        assert_eq!(h.status(premium).ready_replicas, 1);
        assert_eq!(h.runtime.stopped_instances().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_preemptor_releases_its_hold() {
        let h = Harness::with(
            vec![cpu_node("node-a", 4_000)],
            ReconcilerConfig::default(),
            PreemptionMode::LowestQosFirst,
        )
        .await;
        let mut basic = fixed("batch", 1, 4_000);
        basic.qos = kiln_events::QosClass::Basic;
        let basic = h.reconciler.submit(basic).unwrap();
        h.reconcile(basic).await;

        let mut premium = fixed("chat", 1, 2_000);
        premium.qos = kiln_events::QosClass::Premium;
        let premium = h.reconciler.submit(premium).unwrap();
        h.reconcile(premium).await;
        h.reconcile(basic).await;

        h.reconciler.delete(premium).await.unwrap();
        h.reconcile(premium).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(h.reconcile(basic).await.phase, WorkloadPhase::Running);
        assert_eq!(h.allocated_cpu("node-a"), 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_reconcile_leaves_no_reservation() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000)]).await;
        let id = h.reconciler.submit(spec("chat")).unwrap();
        h.runtime.set_start_delay(Some(Duration::from_secs(3)));

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trip.cancel();
        });

        let err = h.reconciler.reconcile_workload(id, &cancel).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(h.allocated_cpu("node-a"), 0);
        let status = h.status(id);
        assert_eq!(status.instances.len(), 1);
        assert_eq!(status.instances[0].phase, InstancePhase::Pending);
        assert_eq!(status.instances[0].node_id, None);

        h.runtime.set_start_delay(None);
        assert_eq!(h.reconcile(id).await.phase, WorkloadPhase::Running);
    }
}
