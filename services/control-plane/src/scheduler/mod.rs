//! Scheduler for instance placement.
//!
//! The scheduler is responsible for:
//! - Filtering nodes that cannot hold an instance (health, capacity, GPU fit)
//! - Scoring the survivors and breaking ties deterministically
//! - Committing the winner into the reservation ledger, re-ranking when a
//!   concurrent placement took the slot first
//! - Reporting infeasibility with the failing constraints and, when
//!   configured, a preemption plan
//!
//! Placement reads the published snapshot and a registry affinity view; it
//! holds no references back into either component.

mod error;
mod filter;
mod preemption;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_events::{AggregateType, EventPayload, QosClass, SchedulingDecidedPayload};
use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use error::{SchedulerError, SchedulerResult};
pub use filter::{InfeasibilityReport, NodeScore, PlacementRequest, ScoreBreakdown};
pub use preemption::{
    policy_for, CostAware, Disabled, LowestQosFirst, PreemptionPlan, PreemptionPolicy, Victim,
    VictimPlan,
};

use crate::config::SchedulerConfig;
use crate::events::EventRecorder;
use crate::registry::{AffinityView, ModelRegistry};
use crate::resources::{ClusterSnapshot, Reservation, ResourceError, ResourceManager};
use filter::PlacementContext;

/// Number of runner-up candidates carried in a decision.
const ALTERNATIVES: usize = 3;

/// The outcome of one successful placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulingDecision {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub node_id: NodeId,
    pub breakdown: ScoreBreakdown,
    /// Next best candidates, best first.
    pub alternatives: Vec<NodeScore>,
    pub snapshot_generation: u64,
    pub decided_at: DateTime<Utc>,
}

/// A reservation committed for a placement that has not been realized yet.
///
/// Dropping it releases the reservation; call [`confirm`](Self::confirm)
/// once the instance record owns it.
#[must_use = "dropping a provisional reservation releases it"]
pub struct ProvisionalReservation {
    resources: Arc<ResourceManager>,
    reservation: Reservation,
    armed: bool,
}

impl ProvisionalReservation {
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub fn confirm(mut self) -> Reservation {
        self.armed = false;
        self.reservation.clone()
    }
}

impl Drop for ProvisionalReservation {
    fn drop(&mut self) {
        if self.armed {
            debug!(
                node_id = %self.reservation.node,
                instance_id = %self.reservation.instance_id,
                "Releasing provisional reservation"
            );
            self.resources
                .release_reservation(&self.reservation.node, &self.reservation.instance_id);
        }
    }
}

impl std::fmt::Debug for ProvisionalReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionalReservation")
            .field("reservation", &self.reservation)
            .field("armed", &self.armed)
            .finish()
    }
}

#[derive(Debug)]
pub struct Placement {
    pub decision: SchedulingDecision,
    pub reservation: ProvisionalReservation,
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub attempts: u64,
    pub placed: u64,
    pub infeasible: u64,
    pub affinity_hits: u64,
    pub commit_conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    placed: AtomicU64,
    infeasible: AtomicU64,
    affinity_hits: AtomicU64,
    commit_conflicts: AtomicU64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    resources: Arc<ResourceManager>,
    registry: Arc<ModelRegistry>,
    events: Arc<EventRecorder>,
    preemption: Box<dyn PreemptionPolicy>,
    counters: Counters,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        resources: Arc<ResourceManager>,
        registry: Arc<ModelRegistry>,
        events: Arc<EventRecorder>,
    ) -> Self {
        let preemption = policy_for(config.preemption);
        Self {
            config,
            resources,
            registry,
            events,
            preemption,
            counters: Counters::default(),
        }
    }

    pub fn with_preemption_policy(mut self, policy: Box<dyn PreemptionPolicy>) -> Self {
        self.preemption = policy;
        self
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            placed: self.counters.placed.load(Ordering::Relaxed),
            infeasible: self.counters.infeasible.load(Ordering::Relaxed),
            affinity_hits: self.counters.affinity_hits.load(Ordering::Relaxed),
            commit_conflicts: self.counters.commit_conflicts.load(Ordering::Relaxed),
        }
    }

    /// Picks a node for `request` and commits a provisional reservation.
    ///
    /// Losing a commit race re-ranks against the updated ledger, so a slot
    /// taken by a concurrent placement turns into `Infeasible` rather than
    /// a double booking.
    #[instrument(
        skip(self, request, cancel),
        fields(instance_id = %request.instance_id, workload_id = %request.workload_id)
    )]
    pub fn schedule(
        &self,
        request: &PlacementRequest,
        cancel: &CancellationToken,
    ) -> SchedulerResult<Placement> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let affinity = self.registry.affinity(&request.model);

        for attempt in 1..=self.config.max_commit_attempts.max(1) {
            let snapshot = self.resources.snapshot();
            if snapshot.stale {
                return Err(SchedulerError::StaleSnapshot);
            }

            let ranked = match self.context(&snapshot, &affinity).rank(request) {
                Ok(ranked) => ranked,
                Err(report) => return Err(self.infeasible(&snapshot, request, report)),
            };
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }

            let best = &ranked[0];
            match self.resources.record_reservation(&best.node_id, &request.claim()) {
                Ok(reservation) => {
                    let alternatives = ranked[1..].iter().take(ALTERNATIVES).cloned().collect();
                    return Ok(self.placed(request, &snapshot, best, alternatives, reservation));
                }
                Err(e @ (ResourceError::Insufficient { .. } | ResourceError::UnknownNode(_))) => {
                    self.counters.commit_conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, node_id = %best.node_id, error = %e, "Lost commit race, re-ranking");
                }
                Err(e) => {
                    warn!(error = %e, "Unexpected ledger error during commit");
                    return Err(SchedulerError::StaleSnapshot);
                }
            }
        }

        Err(SchedulerError::CommitConflict {
            attempts: self.config.max_commit_attempts.max(1),
        })
    }

    /// Places `request` on `node` only. Used to realize migrations.
    #[instrument(skip(self, request, cancel), fields(instance_id = %request.instance_id, node_id = %node))]
    pub fn schedule_pinned(
        &self,
        request: &PlacementRequest,
        node: &NodeId,
        cancel: &CancellationToken,
    ) -> SchedulerResult<Placement> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.resources.snapshot();
        if snapshot.stale {
            return Err(SchedulerError::StaleSnapshot);
        }
        let affinity = self.registry.affinity(&request.model);
        let ctx = self.context(&snapshot, &affinity);

        let mut report = InfeasibilityReport {
            nodes_considered: 1,
            ..InfeasibilityReport::default()
        };
        let view = snapshot.node(node).filter(|v| v.is_healthy());
        let scored = view.and_then(|view| {
            self.resources
                .ledger()
                .view(node, |ledger| ctx.score(request, view, ledger))
        });
        let score = match scored {
            Some(Ok(score)) => score,
            Some(Err(constraints)) => {
                for c in constraints {
                    report.rejections.insert(c, 1);
                }
                return Err(self.infeasible_without_preemption(report));
            }
            None => {
                report.unhealthy = 1;
                return Err(self.infeasible_without_preemption(report));
            }
        };

        match self.resources.record_reservation(node, &request.claim()) {
            Ok(reservation) => Ok(self.placed(request, &snapshot, &score, Vec::new(), reservation)),
            Err(ResourceError::Insufficient { constraints, .. }) => {
                self.counters.commit_conflicts.fetch_add(1, Ordering::Relaxed);
                for c in constraints {
                    report.rejections.insert(c, 1);
                }
                Err(self.infeasible_without_preemption(report))
            }
            Err(_) => {
                report.unhealthy = 1;
                Err(self.infeasible_without_preemption(report))
            }
        }
    }

    fn context<'a>(
        &'a self,
        snapshot: &'a ClusterSnapshot,
        affinity: &'a AffinityView,
    ) -> PlacementContext<'a> {
        PlacementContext {
            snapshot,
            affinity,
            weights: &self.config.weights,
            ledger: self.resources.ledger(),
            now: Instant::now(),
        }
    }

    fn placed(
        &self,
        request: &PlacementRequest,
        snapshot: &ClusterSnapshot,
        best: &NodeScore,
        alternatives: Vec<NodeScore>,
        reservation: Reservation,
    ) -> Placement {
        self.counters.placed.fetch_add(1, Ordering::Relaxed);
        if best.breakdown.model_affinity > 0.0 {
            self.counters.affinity_hits.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            node_id = %best.node_id,
            score = best.breakdown.total,
            model_affinity = best.breakdown.model_affinity,
            "Instance placed"
        );
        self.events.emit(
            AggregateType::Instance,
            request.instance_id.to_string(),
            EventPayload::SchedulingDecided(SchedulingDecidedPayload {
                instance_id: request.instance_id,
                workload_id: request.workload_id,
                node_id: best.node_id.clone(),
                score: best.breakdown.total,
                model_affinity: best.breakdown.model_affinity,
                resource_fit: best.breakdown.resource_fit,
                qos_isolation: best.breakdown.qos_isolation,
                fragmentation_penalty: best.breakdown.fragmentation_penalty,
            }),
        );

        Placement {
            decision: SchedulingDecision {
                instance_id: request.instance_id,
                workload_id: request.workload_id,
                node_id: best.node_id.clone(),
                breakdown: best.breakdown,
                alternatives,
                snapshot_generation: snapshot.generation,
                decided_at: Utc::now(),
            },
            reservation: ProvisionalReservation {
                resources: Arc::clone(&self.resources),
                reservation,
                armed: true,
            },
        }
    }

    fn infeasible(
        &self,
        snapshot: &ClusterSnapshot,
        request: &PlacementRequest,
        report: InfeasibilityReport,
    ) -> SchedulerError {
        self.counters.infeasible.fetch_add(1, Ordering::Relaxed);
        let preemption = self.plan_preemption(snapshot, request);
        debug!(
            report = %report,
            preemption = preemption.is_some(),
            "No feasible node"
        );
        SchedulerError::Infeasible { report, preemption }
    }

    fn infeasible_without_preemption(&self, report: InfeasibilityReport) -> SchedulerError {
        self.counters.infeasible.fetch_add(1, Ordering::Relaxed);
        SchedulerError::Infeasible {
            report,
            preemption: None,
        }
    }

    /// Cheapest node to clear for a Premium request, lowest node id on ties.
    fn plan_preemption(
        &self,
        snapshot: &ClusterSnapshot,
        request: &PlacementRequest,
    ) -> Option<PreemptionPlan> {
        if request.qos != QosClass::Premium {
            return None;
        }
        let ledger = self.resources.ledger();
        let overcommit = ledger.overcommit();

        snapshot
            .healthy_nodes()
            .filter_map(|view| {
                let plan = ledger
                    .view(&view.id, |l| self.preemption.select_victims(l, request, overcommit))??;
                Some(PreemptionPlan {
                    node: view.id.clone(),
                    victims: plan.victims,
                    cost: plan.cost,
                })
            })
            .min_by(|a, b| a.cost.total_cmp(&b.cost).then_with(|| a.node.cmp(&b.node)))
            .inspect(|plan| {
                info!(
                    policy = self.preemption.name(),
                    node_id = %plan.node,
                    victims = plan.victims.len(),
                    "Preemption planned"
                );
            })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("preemption", &self.preemption.name())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ModelHeartbeat, NodeInfo};
    use crate::config::{PreemptionMode, RegistryConfig, ResourceManagerConfig};
    use crate::dev::{FixedBenchmarkRunner, InMemoryStorage, RecordingEventSink, StaticCluster};
    use crate::types::fixtures::GIB;
    use crate::types::{ModelRef, NodeCapacity, ResourceRequest};
    use kiln_events::InfeasibleConstraint;

    struct Harness {
        cluster: Arc<StaticCluster>,
        resources: Arc<ResourceManager>,
        registry: Arc<ModelRegistry>,
        events: Arc<EventRecorder>,
        sink: Arc<RecordingEventSink>,
    }

    impl Harness {
        async fn new(nodes: Vec<NodeInfo>) -> Self {
            let sink = Arc::new(RecordingEventSink::default());
            let events = Arc::new(EventRecorder::new(sink.clone()));
            let cluster = Arc::new(StaticCluster::new(nodes));
            let registry = Arc::new(ModelRegistry::new(
                RegistryConfig::default(),
                Arc::new(InMemoryStorage::new()),
                Arc::new(FixedBenchmarkRunner::default()),
                events.clone(),
            ));
            let resources = Arc::new(
                ResourceManager::new(ResourceManagerConfig::default(), cluster.clone(), events.clone())
                    .with_heartbeat(registry.clone()),
            );
            resources.refresh(&CancellationToken::new()).await.unwrap();
            Self {
                cluster,
                resources,
                registry,
                events,
                sink,
            }
        }

        fn scheduler(&self, preemption: PreemptionMode) -> Scheduler {
            Scheduler::new(
                SchedulerConfig {
                    preemption,
                    ..SchedulerConfig::default()
                },
                self.resources.clone(),
                self.registry.clone(),
                self.events.clone(),
            )
        }
    }

    fn node(name: &str) -> NodeId {
        NodeId::parse(name).unwrap()
    }

    fn cpu_node(name: &str, cpu_millis: u64) -> NodeInfo {
        NodeInfo::new(
            node(name),
            NodeCapacity {
                cpu_millis,
                memory_bytes: 64 * GIB,
                gpu_count: 0,
                gpu_memory_bytes: 0,
            },
        )
    }

    fn gpu_node(name: &str, gpus: u32) -> NodeInfo {
        NodeInfo::new(
            node(name),
            NodeCapacity {
                cpu_millis: 32_000,
                memory_bytes: 128 * GIB,
                gpu_count: gpus,
                gpu_memory_bytes: 80 * GIB,
            },
        )
    }

    fn request(qos: QosClass, resources: ResourceRequest) -> PlacementRequest {
        PlacementRequest {
            instance_id: InstanceId::new(),
            workload_id: WorkloadId::new(),
            model: ModelRef::new("llama2", "v2"),
            request: resources,
            qos,
        }
    }

    #[tokio::test]
    async fn test_equal_nodes_tie_break_to_lowest_id() {
        let h = Harness::new(vec![cpu_node("node-b", 8_000), cpu_node("node-a", 8_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::Disabled);

        let placement = scheduler
            .schedule(&request(QosClass::Standard, ResourceRequest::cpu(2_000, GIB)), &CancellationToken::new())
            .unwrap();
        assert_eq!(placement.decision.node_id, node("node-a"));
        assert_eq!(placement.decision.alternatives.len(), 1);
        assert_eq!(h.sink.count("scheduling.decided"), 1);
        placement.reservation.confirm();
    }

    #[tokio::test]
    async fn test_best_fit_prefers_tighter_node() {
        let h = Harness::new(vec![cpu_node("big", 32_000), cpu_node("small", 4_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::Disabled);

        let placement = scheduler
            .schedule(&request(QosClass::Standard, ResourceRequest::cpu(3_000, GIB)), &CancellationToken::new())
            .unwrap();
        assert_eq!(placement.decision.node_id, node("small"));
    }

    #[tokio::test]
    async fn test_cached_model_wins_once_registered() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000), cpu_node("node-b", 8_000)]).await;
        let model = ModelRef::new("llama2", "v2");
        h.registry.record_cached_models(&node("node-b"), std::slice::from_ref(&model));
        let scheduler = h.scheduler(PreemptionMode::Disabled);
        let req = || request(QosClass::Standard, ResourceRequest::cpu(1_000, GIB));

        // Not registered, so affinity is off and the id tie-break decides
        let placement = scheduler.schedule(&req(), &CancellationToken::new()).unwrap();
        assert_eq!(placement.decision.node_id, node("node-a"));
        assert_eq!(placement.decision.breakdown.model_affinity, 0.0);
        drop(placement);

        let storage = InMemoryStorage::new();
        let checksum = storage.put("s3://models/llama2-v2", b"weights");
        let registry = Arc::new(ModelRegistry::new(
            RegistryConfig::default(),
            Arc::new(storage),
            Arc::new(FixedBenchmarkRunner::default()),
            h.events.clone(),
        ));
        let cancel = CancellationToken::new();
        registry
            .register("llama2", "v2", "s3://models/llama2-v2", &checksum, &cancel)
            .await
            .unwrap();
        registry.record_cached_models(&node("node-b"), std::slice::from_ref(&model));

        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            h.resources.clone(),
            registry,
            h.events.clone(),
        );
        let placement = scheduler.schedule(&req(), &CancellationToken::new()).unwrap();
        assert_eq!(placement.decision.node_id, node("node-b"));
        assert_eq!(placement.decision.breakdown.model_affinity, 1.0);
        assert_eq!(scheduler.metrics().affinity_hits, 1);
    }

    #[tokio::test]
    async fn test_dropping_placement_releases_reservation() {
        let h = Harness::new(vec![cpu_node("node-a", 4_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::Disabled);
        let req = request(QosClass::Standard, ResourceRequest::cpu(4_000, GIB));

        let placement = scheduler.schedule(&req, &CancellationToken::new()).unwrap();
        assert_eq!(h.resources.ledger().allocation(&node("node-a")).unwrap().cpu_millis, 4_000);
        drop(placement);
        assert_eq!(h.resources.ledger().allocation(&node("node-a")).unwrap().cpu_millis, 0);

        let confirmed = scheduler.schedule(&req, &CancellationToken::new()).unwrap();
        let reservation = confirmed.reservation.confirm();
        assert_eq!(reservation.cpu_millis, 4_000);
        assert_eq!(h.resources.ledger().allocation(&node("node-a")).unwrap().cpu_millis, 4_000);
    }

    #[tokio::test]
    async fn test_infeasible_reports_each_constraint() {
        let h = Harness::new(vec![cpu_node("cpu-a", 2_000), gpu_node("gpu-a", 1)]).await;
        h.cluster.set_ready(&node("gpu-a"), false);
        h.resources.refresh(&CancellationToken::new()).await.unwrap();
        let scheduler = h.scheduler(PreemptionMode::Disabled);

        let err = scheduler
            .schedule(
                &request(QosClass::Standard, ResourceRequest::cpu(4_000, GIB).with_gpus(1, 0)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        match err {
            SchedulerError::Infeasible { report, preemption } => {
                assert_eq!(report.unhealthy, 1);
                assert_eq!(
                    report.constraints(),
                    vec![InfeasibleConstraint::InsufficientCpu, InfeasibleConstraint::InsufficientGpu]
                );
                assert!(preemption.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(scheduler.metrics().infeasible, 1);
    }

    #[tokio::test]
    async fn test_all_unhealthy_and_no_nodes() {
        let h = Harness::new(vec![cpu_node("cpu-a", 8_000)]).await;
        h.cluster.set_ready(&node("cpu-a"), false);
        h.resources.refresh(&CancellationToken::new()).await.unwrap();
        let scheduler = h.scheduler(PreemptionMode::Disabled);
        let req = request(QosClass::Standard, ResourceRequest::cpu(1_000, GIB));

        let err = scheduler.schedule(&req, &CancellationToken::new()).unwrap_err();
        let SchedulerError::Infeasible { report, .. } = err else {
            panic!("expected infeasible");
        };
        assert_eq!(report.constraints(), vec![InfeasibleConstraint::AllUnhealthy]);

        let empty = Harness::new(Vec::new()).await;
        let err = empty
            .scheduler(PreemptionMode::Disabled)
            .schedule(&req, &CancellationToken::new())
            .unwrap_err();
        let SchedulerError::Infeasible { report, .. } = err else {
            panic!("expected infeasible");
        };
        assert_eq!(report.constraints(), vec![InfeasibleConstraint::NoNodes]);
    }

    #[tokio::test]
    async fn test_stale_snapshot_defers() {
        let sink = Arc::new(RecordingEventSink::default());
        let events = Arc::new(EventRecorder::new(sink));
        let resources = Arc::new(ResourceManager::new(
            ResourceManagerConfig::default(),
            Arc::new(StaticCluster::new([cpu_node("cpu-a", 8_000)])),
            events.clone(),
        ));
        let registry = Arc::new(ModelRegistry::new(
            RegistryConfig::default(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(FixedBenchmarkRunner::default()),
            events.clone(),
        ));
        let scheduler = Scheduler::new(SchedulerConfig::default(), resources, registry, events);

        let err = scheduler
            .schedule(&request(QosClass::Basic, ResourceRequest::cpu(1_000, GIB)), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::StaleSnapshot));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_reserves_nothing() {
        let h = Harness::new(vec![cpu_node("cpu-a", 8_000)]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .scheduler(PreemptionMode::Disabled)
            .schedule(&request(QosClass::Basic, ResourceRequest::cpu(1_000, GIB)), &cancel)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled));
        assert_eq!(h.resources.ledger().allocation(&node("cpu-a")).unwrap().cpu_millis, 0);
    }

    #[tokio::test]
    async fn test_premium_on_basic_node_scores_isolation_zero() {
        let h = Harness::new(vec![cpu_node("node-a", 16_000), cpu_node("node-b", 16_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::Disabled);
        let basic = scheduler
            .schedule(&request(QosClass::Basic, ResourceRequest::cpu(1_000, GIB)), &CancellationToken::new())
            .unwrap();
        assert_eq!(basic.decision.node_id, node("node-a"));
        basic.reservation.confirm();

        let premium = scheduler
            .schedule(&request(QosClass::Premium, ResourceRequest::cpu(1_000, GIB)), &CancellationToken::new())
            .unwrap();
        assert_eq!(premium.decision.node_id, node("node-b"));
        let rejected = &premium.decision.alternatives[0];
        assert_eq!(rejected.node_id, node("node-a"));
        assert_eq!(rejected.breakdown.qos_isolation, 0.0);
    }

    #[tokio::test]
    async fn test_premium_request_gets_preemption_plan() {
        let h = Harness::new(vec![cpu_node("node-a", 4_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::LowestQosFirst);
        let basic = request(QosClass::Basic, ResourceRequest::cpu(4_000, GIB));
        scheduler
            .schedule(&basic, &CancellationToken::new())
            .unwrap()
            .reservation
            .confirm();

        let err = scheduler
            .schedule(&request(QosClass::Premium, ResourceRequest::cpu(2_000, GIB)), &CancellationToken::new())
            .unwrap_err();
        let SchedulerError::Infeasible { preemption: Some(plan), .. } = err else {
            panic!("expected a preemption plan");
        };
        assert_eq!(plan.node, node("node-a"));
        assert_eq!(plan.victims.len(), 1);
        assert_eq!(plan.victims[0].instance_id, basic.instance_id);

        // Standard requests never preempt
        let err = scheduler
            .schedule(&request(QosClass::Standard, ResourceRequest::cpu(2_000, GIB)), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Infeasible { preemption: None, .. }));
    }

    #[tokio::test]
    async fn test_pinned_placement_only_uses_target() {
        let h = Harness::new(vec![cpu_node("node-a", 8_000), cpu_node("node-b", 2_000)]).await;
        let scheduler = h.scheduler(PreemptionMode::Disabled);

        let placed = scheduler
            .schedule_pinned(
                &request(QosClass::Standard, ResourceRequest::cpu(1_000, GIB)),
                &node("node-b"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(placed.decision.node_id, node("node-b"));
        assert!(placed.decision.alternatives.is_empty());

        let err = scheduler
            .schedule_pinned(
                &request(QosClass::Standard, ResourceRequest::cpu(4_000, GIB)),
                &node("node-b"),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(err.is_infeasible());
    }

    #[tokio::test]
    async fn test_identical_inputs_give_identical_decisions() {
        let nodes = || {
            vec![
                gpu_node("gpu-c", 2),
                gpu_node("gpu-a", 2),
                gpu_node("gpu-b", 2),
                cpu_node("cpu-a", 16_000),
            ]
        };
        let mut chosen = Vec::new();
        for _ in 0..2 {
            let h = Harness::new(nodes()).await;
            let scheduler = h.scheduler(PreemptionMode::Disabled);
            let mut run = Vec::new();
            for gpus in [1, 2, 1, 0] {
                let req = request(QosClass::Standard, ResourceRequest::cpu(2_000, 8 * GIB).with_gpus(gpus, 0));
                let placement = scheduler.schedule(&req, &CancellationToken::new()).unwrap();
                run.push(placement.decision.node_id.clone());
                placement.reservation.confirm();
            }
            chosen.push(run);
        }
        assert_eq!(chosen[0], chosen[1]);
    }
}
