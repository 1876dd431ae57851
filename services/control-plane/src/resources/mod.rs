//! Resource manager.
//!
//! Maintains the cluster snapshot and the reservation ledger, and makes
//! scaling and rebalancing decisions.
//!
//! ## Snapshot
//!
//! A single refresh task polls the cluster metrics collaborator and
//! publishes a fully built [`ClusterSnapshot`] through an `ArcSwap`.
//! Readers load the current `Arc` without locking and never observe a
//! partially built snapshot.
//!
//! ## Reservations
//!
//! Reservations are recorded the moment a placement is committed, ahead of
//! the next poll. When the cluster reports its own allocation figures, a
//! node whose ledger keeps diverging from the report is resynced.

mod error;
mod ledger;
mod rebalance;
mod scaling;
mod snapshot;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future::join_all;
use kiln_events::{
    AggregateType, EventPayload, LedgerResyncedPayload, NodeHealth, NodeHealthChangedPayload,
    RebalanceRecommendedPayload, ScalingDirection,
};
use kiln_id::{InstanceId, NodeId, WorkloadId};
use kiln_reconcile::ConsecutiveCounter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use error::{ResourceError, ResourceResult};
pub use ledger::{
    Claim, GpuSlice, Hold, NodeLedger, Reservation, ReservationEntry, ReservationLedger,
};
pub use rebalance::{MigrationReason, MigrationRecommendation};
pub use scaling::ScalingDecision;
pub use snapshot::{ClusterSnapshot, ClusterSummary, NodeView};
pub use worker::SnapshotWorker;

use crate::collaborators::{call_with_deadline, CallError, ClusterMetrics, ModelHeartbeat, NodeInfo};
use crate::config::ResourceManagerConfig;
use crate::events::EventRecorder;
use crate::types::{MetricSamples, ResourceRequest, ScalingPolicy};

#[derive(Debug, Default)]
struct Tracking {
    divergence: BTreeMap<NodeId, ConsecutiveCounter>,
    forecast: BTreeMap<NodeId, f64>,
}

pub struct ResourceManager {
    config: ResourceManagerConfig,
    cluster: Arc<dyn ClusterMetrics>,
    events: Arc<EventRecorder>,
    heartbeat: Option<Arc<dyn ModelHeartbeat>>,
    snapshot: ArcSwap<ClusterSnapshot>,
    ledger: ReservationLedger,
    tracking: Mutex<Tracking>,
    cooldowns: DashMap<WorkloadId, ConsecutiveCounter>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl ResourceManager {
    pub fn new(
        config: ResourceManagerConfig,
        cluster: Arc<dyn ClusterMetrics>,
        events: Arc<EventRecorder>,
    ) -> Self {
        let ledger = ReservationLedger::new(config.overcommit_ratio);
        Self {
            config,
            cluster,
            events,
            heartbeat: None,
            snapshot: ArcSwap::from_pointee(ClusterSnapshot::empty_stale()),
            ledger,
            tracking: Mutex::new(Tracking::default()),
            cooldowns: DashMap::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Forwards the models each node reports as cached.
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn ModelHeartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// The current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    fn stale_after(&self) -> Duration {
        self.config.refresh_interval * self.config.stale_after_intervals
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Polls the cluster and publishes a new snapshot.
    ///
    /// On collaborator failure the last good snapshot stays in place with
    /// its staleness flag set. A cancelled refresh publishes nothing.
    #[instrument(skip(self, cancel))]
    pub async fn refresh(&self, cancel: &CancellationToken) -> ResourceResult<()> {
        let _gate = self.refresh_gate.lock().await;
        let timeout = self.config.call_timeout;

        let listed = match call_with_deadline(cancel, timeout, self.cluster.list_nodes()).await {
            Ok(nodes) => nodes,
            Err(CallError::Cancelled) => return Err(ResourceError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Cluster metrics unavailable, keeping last snapshot");
                self.publish_degraded(Instant::now());
                return Err(ResourceError::Collaborator(e.to_string()));
            }
        };

        let utilization = join_all(listed.iter().map(|node| {
            call_with_deadline(cancel, timeout, self.cluster.node_utilization(&node.id))
        }))
        .await;
        if cancel.is_cancelled() {
            return Err(ResourceError::Cancelled);
        }

        let now = Instant::now();
        let previous = self.snapshot.load_full();
        let mut nodes = BTreeMap::new();
        let mut resynced = Vec::new();

        {
            let mut tracking = self.tracking.lock();
            for (info, util) in listed.iter().zip(utilization) {
                let prior = previous.node(&info.id);
                let utilization = match util {
                    Ok(u) => u,
                    Err(e) => {
                        debug!(node_id = %info.id, error = %e, "Utilization unavailable, reusing last sample");
                        prior.map(|v| v.utilization).unwrap_or_default()
                    }
                };

                self.ledger.sync_capacity(&info.id, info.capacity);

                let peak = utilization.peak();
                let alpha = self.config.forecast_alpha;
                let forecast = *tracking
                    .forecast
                    .entry(info.id.clone())
                    .and_modify(|f| *f = alpha * peak + (1.0 - alpha) * *f)
                    .or_insert(peak);

                if let Some(payload) = self.check_divergence(&mut tracking, info) {
                    resynced.push(payload);
                }

                let health = if info.ready {
                    NodeHealth::Healthy
                } else {
                    NodeHealth::Unhealthy
                };
                nodes.insert(
                    info.id.clone(),
                    NodeView {
                        id: info.id.clone(),
                        capacity: info.capacity,
                        allocated: self.ledger.allocation(&info.id).unwrap_or_default(),
                        utilization,
                        cached_models: info.cached_models.clone(),
                        health,
                        last_seen: now,
                        forecast: Some(forecast),
                    },
                );
            }
        }

        // Nodes missing from this poll keep their last view until they age out
        for (id, view) in &previous.nodes {
            if !nodes.contains_key(id) {
                nodes.insert(id.clone(), self.aged(view, now, "not reported by cluster"));
            }
        }

        self.announce_health_changes(&previous, &nodes, "node readiness changed");
        for payload in resynced {
            self.events.emit(
                AggregateType::Node,
                payload.node_id.to_string(),
                EventPayload::LedgerResynced(payload),
            );
        }
        if let Some(heartbeat) = &self.heartbeat {
            for view in nodes.values() {
                if view.is_healthy() {
                    heartbeat.record_cached_models(&view.id, &view.cached_models);
                } else {
                    heartbeat.forget_node(&view.id);
                }
            }
        }

        let generation = previous.generation + 1;
        debug!(generation, nodes = nodes.len(), "Snapshot refreshed");
        self.snapshot.store(Arc::new(ClusterSnapshot {
            generation,
            stale: false,
            nodes,
        }));
        Ok(())
    }

    /// Republishes the last snapshot marked stale, aging out nodes that
    /// have not been seen for too long.
    fn publish_degraded(&self, now: Instant) {
        let previous = self.snapshot.load_full();
        let nodes: BTreeMap<_, _> = previous
            .nodes
            .iter()
            .map(|(id, view)| (id.clone(), self.aged(view, now, "no report within staleness window")))
            .collect();
        self.announce_health_changes(&previous, &nodes, "no report within staleness window");
        self.snapshot.store(Arc::new(ClusterSnapshot {
            generation: previous.generation,
            stale: true,
            nodes,
        }));
    }

    fn aged(&self, view: &NodeView, now: Instant, why: &str) -> NodeView {
        let mut view = view.clone();
        view.allocated = self.ledger.allocation(&view.id).unwrap_or(view.allocated);
        if now.saturating_duration_since(view.last_seen) > self.stale_after() {
            if view.health == NodeHealth::Healthy {
                debug!(node_id = %view.id, reason = why, "Node aged out");
            }
            view.health = NodeHealth::Unhealthy;
        }
        view
    }

    fn announce_health_changes(
        &self,
        previous: &ClusterSnapshot,
        nodes: &BTreeMap<NodeId, NodeView>,
        reason: &str,
    ) {
        for (id, view) in nodes {
            let Some(old) = previous.node(id) else {
                continue;
            };
            if old.health != view.health {
                warn!(node_id = %id, old = ?old.health, new = ?view.health, "Node health changed");
                self.events.emit(
                    AggregateType::Node,
                    id.to_string(),
                    EventPayload::NodeHealthChanged(NodeHealthChangedPayload {
                        node_id: id.clone(),
                        old_health: old.health,
                        new_health: view.health,
                        reason: reason.to_string(),
                    }),
                );
            }
        }
    }

    fn check_divergence(
        &self,
        tracking: &mut Tracking,
        info: &NodeInfo,
    ) -> Option<LedgerResyncedPayload> {
        let reported = info.reported_allocation?;
        let divergence = self.ledger.view(&info.id, |l| l.divergence(&reported))?;
        let counter = tracking.divergence.entry(info.id.clone()).or_default();
        let streak = counter.observe(divergence > self.config.divergence_threshold);
        if streak < self.config.divergence_polls {
            return None;
        }
        counter.reset();

        let before = self.ledger.update(&info.id, |l| {
            let before = l.allocation();
            l.resync(&reported);
            before
        })?;
        info!(
            node_id = %info.id,
            ledger_cpu_millis = before.cpu_millis,
            reported_cpu_millis = reported.cpu_millis,
            "Ledger resynced from cluster report"
        );
        Some(LedgerResyncedPayload {
            node_id: info.id.clone(),
            ledger_cpu_millis: before.cpu_millis,
            reported_cpu_millis: reported.cpu_millis,
            ledger_memory_bytes: before.memory_bytes,
            reported_memory_bytes: reported.memory_bytes,
        })
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Records a committed placement. Fails if the node can no longer hold
    /// the claim.
    pub fn record_reservation(&self, node: &NodeId, claim: &Claim) -> ResourceResult<Reservation> {
        let reservation = self.ledger.reserve(node, claim)?;
        debug!(node_id = %node, instance_id = %claim.instance_id, "Reservation recorded");
        Ok(reservation)
    }

    pub fn release_reservation(
        &self,
        node: &NodeId,
        instance: &InstanceId,
    ) -> Option<ReservationEntry> {
        let released = self.ledger.release(node, instance);
        if released.is_some() {
            debug!(node_id = %node, instance_id = %instance, "Reservation released");
        }
        released
    }

    // =========================================================================
    // Scaling
    // =========================================================================

    /// Decides the replica target for a workload from per-instance samples.
    ///
    /// Deferred while the snapshot is stale; the result is always within the
    /// policy's bounds.
    pub fn evaluate_scaling(
        &self,
        workload_id: WorkloadId,
        policy: &ScalingPolicy,
        current_replicas: u32,
        samples: &[MetricSamples],
    ) -> ScalingDecision {
        if self.snapshot.load().stale {
            return ScalingDecision {
                workload_id,
                current_replicas,
                target_replicas: policy.clamp(current_replicas),
                direction: ScalingDirection::Deferred,
                reason: "cluster snapshot is stale".to_string(),
            };
        }

        let mut streak = self.cooldowns.entry(workload_id).or_default();
        let (target_replicas, direction, reason) = scaling::evaluate(
            policy,
            current_replicas,
            samples,
            &mut streak,
            self.config.scale_down_cooldown,
        );
        ScalingDecision {
            workload_id,
            current_replicas,
            target_replicas,
            direction,
            reason,
        }
    }

    pub fn forget_workload(&self, workload_id: &WorkloadId) {
        self.cooldowns.remove(workload_id);
    }

    // =========================================================================
    // Cluster views
    // =========================================================================

    pub fn cluster_summary(&self) -> ClusterSummary {
        let snapshot = self.snapshot();
        let mut summary = ClusterSummary {
            generation: snapshot.generation,
            stale: snapshot.stale,
            ..ClusterSummary::default()
        };
        let mut utilization = 0.0;
        for view in snapshot.nodes.values() {
            if !view.is_healthy() {
                summary.unhealthy_nodes += 1;
                continue;
            }
            summary.healthy_nodes += 1;
            summary.total_cpu_millis += view.capacity.cpu_millis;
            summary.total_memory_bytes += view.capacity.memory_bytes;
            summary.total_gpus += view.capacity.gpu_count;
            let allocated = self.ledger.allocation(&view.id).unwrap_or(view.allocated);
            summary.allocated.cpu_millis += allocated.cpu_millis;
            summary.allocated.memory_bytes += allocated.memory_bytes;
            summary.allocated.gpus_in_use += allocated.gpus_in_use;
            utilization += view.utilization.peak();
        }
        if summary.healthy_nodes > 0 {
            summary.mean_utilization = utilization / summary.healthy_nodes as f64;
        }
        summary
    }

    /// Proposes migrations. Only recommendations: nothing is moved here.
    ///
    /// `pending` lists the requests of instances still awaiting placement;
    /// fragmentation only matters when it blocks one of them, or when there
    /// is no pending demand at all.
    #[instrument(skip(self, pending), fields(pending = pending.len()))]
    pub fn rebalance(&self, pending: &[ResourceRequest]) -> Vec<MigrationRecommendation> {
        let snapshot = self.snapshot();
        if snapshot.stale {
            debug!("Skipping rebalance on stale snapshot");
            return Vec::new();
        }

        let ledgers = snapshot
            .healthy_nodes()
            .filter_map(|view| Some((view.id.clone(), self.ledger.copy_of(&view.id)?)))
            .collect();
        let plan = rebalance::Planner {
            config: &self.config,
            overcommit: self.ledger.overcommit(),
            ledgers,
        }
        .plan(pending);

        for rec in &plan {
            info!(
                instance_id = %rec.instance_id,
                from = %rec.from_node,
                to = %rec.to_node,
                reason = %rec.reason,
                "Migration recommended"
            );
            self.events.emit(
                AggregateType::Instance,
                rec.instance_id.to_string(),
                EventPayload::RebalanceRecommended(RebalanceRecommendedPayload {
                    instance_id: rec.instance_id,
                    workload_id: rec.workload_id,
                    from_node: rec.from_node.clone(),
                    to_node: rec.to_node.clone(),
                    reason: rec.reason.to_string(),
                }),
            );
        }
        plan
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("generation", &self.snapshot.load().generation)
            .finish_non_exhaustive()
    }
}
