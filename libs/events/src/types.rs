//! Status enums and event payloads.

use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Workload
    pub const WORKLOAD_SUBMITTED: &str = "workload.submitted";
    pub const WORKLOAD_UPDATED: &str = "workload.updated";
    pub const WORKLOAD_DELETED: &str = "workload.deleted";
    pub const WORKLOAD_PHASE_CHANGED: &str = "workload.phase_changed";

    // Instance
    pub const INSTANCE_CREATED: &str = "instance.created";
    pub const INSTANCE_PHASE_CHANGED: &str = "instance.phase_changed";

    // Decisions
    pub const SCHEDULING_DECIDED: &str = "scheduling.decided";
    pub const SCHEDULING_FAILED: &str = "scheduling.failed";
    pub const SCALING_DECIDED: &str = "scaling.decided";

    // Registry
    pub const MODEL_REGISTERED: &str = "model.registered";
    pub const MODEL_BENCHMARKED: &str = "model.benchmarked";
    pub const MODEL_DELETED: &str = "model.deleted";

    // Cluster
    pub const NODE_HEALTH_CHANGED: &str = "node.health_changed";
    pub const REBALANCE_RECOMMENDED: &str = "rebalance.recommended";
    pub const LEDGER_RESYNCED: &str = "ledger.resynced";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Priority and isolation tier.
///
/// Variants are declared lowest first, so `Ord` ranks `Basic < Standard <
/// Premium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosClass {
    Basic,
    Standard,
    Premium,
}

impl std::fmt::Display for QosClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QosClass::Basic => "basic",
            QosClass::Standard => "standard",
            QosClass::Premium => "premium",
        };
        f.write_str(s)
    }
}

/// Workload lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    /// Declared, no instances yet.
    Pending,
    /// At least one instance is awaiting placement.
    Scheduling,
    /// Replica count within bounds and every instance healthy.
    Running,
    /// Replica count is moving toward a new target.
    Scaling,
    /// Some instances unhealthy but the workload is still serving.
    Degraded,
    /// Could not converge after bounded retries. Left alone until its workload spec is updated.
    Failed,
    Terminating,
    Terminated,
}

impl WorkloadPhase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Terminated)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkloadPhase) -> bool {
        use WorkloadPhase::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (Terminated, _) => false,
            (Terminating, Terminated) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            (_, Terminated) => false,
            (Failed, Pending | Scheduling) => true,
            (Failed, _) => false,
            (_, Pending) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkloadPhase::Pending => "pending",
            WorkloadPhase::Scheduling => "scheduling",
            WorkloadPhase::Running => "running",
            WorkloadPhase::Scaling => "scaling",
            WorkloadPhase::Degraded => "degraded",
            WorkloadPhase::Failed => "failed",
            WorkloadPhase::Terminating => "terminating",
            WorkloadPhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Instance lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Awaiting placement. Never bound to a node.
    Pending,
    /// Node reserved and start requested, not yet confirmed healthy.
    Starting,
    /// Confirmed started on its node and passing health checks.
    Running,
    /// Stop requested; the reservation is still held.
    Terminating,
    Terminated,
    Failed,
}

impl InstancePhase {
    /// Terminated and failed instances no longer count as replicas.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, InstancePhase::Terminated | InstancePhase::Failed)
    }

    /// Phases in which the instance owns a node reservation.
    #[must_use]
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            InstancePhase::Starting | InstancePhase::Running | InstancePhase::Terminating
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: InstancePhase) -> bool {
        use InstancePhase::*;

        matches!(
            (self, next),
            (Pending, Starting | Terminated | Failed)
                | (Starting, Running | Terminating | Failed)
                | (Running, Terminating | Failed)
                | (Terminating, Terminated | Failed)
        )
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstancePhase::Pending => "pending",
            InstancePhase::Starting => "starting",
            InstancePhase::Running => "running",
            InstancePhase::Terminating => "terminating",
            InstancePhase::Terminated => "terminated",
            InstancePhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Node health as seen by the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

/// Catalog entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Checksum verified, no benchmark recorded yet.
    Unbenchmarked,
    /// Checksum verified and a benchmark result is stored.
    Benchmarked,
    /// The last benchmark attempt failed. Still usable for scheduling.
    BenchmarkFailed,
}

impl ModelStatus {
    /// Whether the scheduler weighs model affinity for this entry. Only a
    /// failed benchmark drops it to resource-only scoring.
    #[must_use]
    pub fn allows_affinity(&self) -> bool {
        !matches!(self, ModelStatus::BenchmarkFailed)
    }
}

/// A single constraint that rejected a node during filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfeasibleConstraint {
    InsufficientCpu,
    InsufficientMemory,
    InsufficientGpu,
    /// Enough GPU memory in aggregate, but no single device has enough free.
    GpuFragmented,
    AllUnhealthy,
    NoNodes,
}

impl std::fmt::Display for InfeasibleConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InfeasibleConstraint::InsufficientCpu => "insufficient cpu",
            InfeasibleConstraint::InsufficientMemory => "insufficient memory",
            InfeasibleConstraint::InsufficientGpu => "insufficient gpu",
            InfeasibleConstraint::GpuFragmented => "gpu memory fragmented",
            InfeasibleConstraint::AllUnhealthy => "all nodes unhealthy",
            InfeasibleConstraint::NoNodes => "no nodes",
        };
        f.write_str(s)
    }
}

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
    Hold,
    /// No decision because the snapshot is stale.
    Deferred,
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSubmittedPayload {
    pub workload_id: WorkloadId,
    pub name: String,
    pub model_name: String,
    pub model_version: String,
    pub qos: QosClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUpdatedPayload {
    pub workload_id: WorkloadId,
    pub generation: u64,
    pub spec_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDeletedPayload {
    pub workload_id: WorkloadId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadPhaseChangedPayload {
    pub workload_id: WorkloadId,
    pub old_phase: WorkloadPhase,
    pub new_phase: WorkloadPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceCreatedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePhaseChangedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub old_phase: InstancePhase,
    pub new_phase: InstancePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingDecidedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub node_id: NodeId,
    pub score: f64,
    pub model_affinity: f64,
    pub resource_fit: f64,
    pub qos_isolation: f64,
    pub fragmentation_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingFailedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub constraints: Vec<InfeasibleConstraint>,
    pub attempt: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecidedPayload {
    pub workload_id: WorkloadId,
    pub current_replicas: u32,
    pub target_replicas: u32,
    pub direction: ScalingDirection,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRegisteredPayload {
    pub model_name: String,
    pub version: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBenchmarkedPayload {
    pub model_name: String,
    pub version: String,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput_per_unit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDeletedPayload {
    pub model_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealthChangedPayload {
    pub node_id: NodeId,
    pub old_health: NodeHealth,
    pub new_health: NodeHealth,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecommendedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerResyncedPayload {
    pub node_id: NodeId,
    pub ledger_cpu_millis: u64,
    pub reported_cpu_millis: u64,
    pub ledger_memory_bytes: u64,
    pub reported_memory_bytes: u64,
}

/// Every payload the core emits, tagged by its event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "workload.submitted")]
    WorkloadSubmitted(WorkloadSubmittedPayload),
    #[serde(rename = "workload.updated")]
    WorkloadUpdated(WorkloadUpdatedPayload),
    #[serde(rename = "workload.deleted")]
    WorkloadDeleted(WorkloadDeletedPayload),
    #[serde(rename = "workload.phase_changed")]
    WorkloadPhaseChanged(WorkloadPhaseChangedPayload),
    #[serde(rename = "instance.created")]
    InstanceCreated(InstanceCreatedPayload),
    #[serde(rename = "instance.phase_changed")]
    InstancePhaseChanged(InstancePhaseChangedPayload),
    #[serde(rename = "scheduling.decided")]
    SchedulingDecided(SchedulingDecidedPayload),
    #[serde(rename = "scheduling.failed")]
    SchedulingFailed(SchedulingFailedPayload),
    #[serde(rename = "scaling.decided")]
    ScalingDecided(ScalingDecidedPayload),
    #[serde(rename = "model.registered")]
    ModelRegistered(ModelRegisteredPayload),
    #[serde(rename = "model.benchmarked")]
    ModelBenchmarked(ModelBenchmarkedPayload),
    #[serde(rename = "model.deleted")]
    ModelDeleted(ModelDeletedPayload),
    #[serde(rename = "node.health_changed")]
    NodeHealthChanged(NodeHealthChangedPayload),
    #[serde(rename = "rebalance.recommended")]
    RebalanceRecommended(RebalanceRecommendedPayload),
    #[serde(rename = "ledger.resynced")]
    LedgerResynced(LedgerResyncedPayload),
}

impl EventPayload {
    /// The dotted event type name matching [`event_types`].
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        use event_types::*;

        match self {
            EventPayload::WorkloadSubmitted(_) => WORKLOAD_SUBMITTED,
            EventPayload::WorkloadUpdated(_) => WORKLOAD_UPDATED,
            EventPayload::WorkloadDeleted(_) => WORKLOAD_DELETED,
            EventPayload::WorkloadPhaseChanged(_) => WORKLOAD_PHASE_CHANGED,
            EventPayload::InstanceCreated(_) => INSTANCE_CREATED,
            EventPayload::InstancePhaseChanged(_) => INSTANCE_PHASE_CHANGED,
            EventPayload::SchedulingDecided(_) => SCHEDULING_DECIDED,
            EventPayload::SchedulingFailed(_) => SCHEDULING_FAILED,
            EventPayload::ScalingDecided(_) => SCALING_DECIDED,
            EventPayload::ModelRegistered(_) => MODEL_REGISTERED,
            EventPayload::ModelBenchmarked(_) => MODEL_BENCHMARKED,
            EventPayload::ModelDeleted(_) => MODEL_DELETED,
            EventPayload::NodeHealthChanged(_) => NODE_HEALTH_CHANGED,
            EventPayload::RebalanceRecommended(_) => REBALANCE_RECOMMENDED,
            EventPayload::LedgerResynced(_) => LEDGER_RESYNCED,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
