//! In-memory workload records.
//!
//! Each workload lives behind its own async mutex; a reconcile pass holds
//! it for the whole pass, which is what keeps two reconciles of the same
//! workload from interleaving. A status snapshot is published after every
//! mutation so status reads never wait on a pass in progress.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_events::{InstancePhase, QosClass, WorkloadPhase};
use kiln_id::{InstanceId, NodeId, WorkloadId};
use kiln_reconcile::{ConvergenceStatus, RetryTracker, SpecHash};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::collaborators::HealthStatus;
use crate::resources::{MigrationRecommendation, Reservation};
use crate::types::{MetricKind, MetricSamples, ModelRef, ResourceRequest, WorkloadSpec};

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct InstanceRecord {
    pub id: InstanceId,
    /// Creation order within the workload.
    pub ordinal: u64,
    pub phase: InstancePhase,
    pub node: Option<NodeId>,
    pub reservation: Option<Reservation>,
    pub template_hash: SpecHash,
    pub created_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub health: HealthStatus,
    pub metrics: MetricSamples,
    /// Runtime backoff: no start or stop attempt before this.
    pub next_attempt_at: Option<Instant>,
    pub runtime_failures: u32,
}

impl InstanceRecord {
    pub fn pending(ordinal: u64, template_hash: SpecHash) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            ordinal,
            phase: InstancePhase::Pending,
            node: None,
            reservation: None,
            template_hash,
            created_at: now,
            transitioned_at: now,
            ready_at: None,
            reason: None,
            health: HealthStatus::Unknown,
            metrics: MetricSamples::new(),
            next_attempt_at: None,
            runtime_failures: 0,
        }
    }

    pub fn is_serving(&self) -> bool {
        self.phase == InstancePhase::Running && self.health != HealthStatus::Unhealthy
    }

    /// Active and not already on its way out.
    pub fn is_live(&self) -> bool {
        self.phase.is_active() && self.phase != InstancePhase::Terminating
    }
}

#[derive(Debug)]
pub(crate) struct WorkloadRecord {
    pub id: WorkloadId,
    pub spec: WorkloadSpec,
    pub spec_hash: SpecHash,
    pub template_hash: SpecHash,
    pub generation: u64,
    pub observed_generation: u64,
    pub phase: WorkloadPhase,
    pub desired_replicas: u32,
    pub instances: BTreeMap<InstanceId, InstanceRecord>,
    pub next_ordinal: u64,
    pub deleted: bool,
    pub last_error: Option<String>,
    pub infeasible_attempts: u32,
    /// Infeasibility backoff: no placement attempt before this.
    pub next_schedule_at: Option<Instant>,
    pub restarts: RetryTracker<InstanceId>,
    pub sla_at_risk: bool,
    /// Node holding capacity for this workload while its preemption runs.
    pub preemption_hold: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkloadRecord {
    pub fn new(
        id: WorkloadId,
        spec: WorkloadSpec,
        spec_hash: SpecHash,
        template_hash: SpecHash,
        restarts: RetryTracker<InstanceId>,
    ) -> Self {
        let now = Utc::now();
        let desired_replicas = spec.scaling.min_replicas;
        Self {
            id,
            spec,
            spec_hash,
            template_hash,
            generation: 1,
            observed_generation: 0,
            phase: WorkloadPhase::Pending,
            desired_replicas,
            instances: BTreeMap::new(),
            next_ordinal: 0,
            deleted: false,
            last_error: None,
            infeasible_attempts: 0,
            next_schedule_at: None,
            restarts,
            sla_at_risk: false,
            preemption_hold: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_pending(&mut self) -> InstanceId {
        let record = InstanceRecord::pending(self.next_ordinal, self.template_hash.clone());
        self.next_ordinal += 1;
        let id = record.id;
        self.instances.insert(id, record);
        id
    }

    pub fn has_pending_current(&self) -> bool {
        self.instances
            .values()
            .any(|i| i.phase == InstancePhase::Pending && self.is_current(i))
    }

    pub fn live(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values().filter(|i| i.is_live())
    }

    pub fn is_current(&self, instance: &InstanceRecord) -> bool {
        instance.template_hash == self.template_hash
    }

    /// Mean reported latency over serving instances.
    pub fn observed_latency(&self) -> Option<f64> {
        let samples: Vec<f64> = self
            .instances
            .values()
            .filter(|i| i.is_serving())
            .filter_map(|i| i.metrics.get(&MetricKind::LatencyMs).copied())
            .collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        }
    }

    pub fn status(&self) -> WorkloadStatus {
        let mut instances: Vec<&InstanceRecord> = self.instances.values().collect();
        instances.sort_by_key(|i| i.ordinal);

        WorkloadStatus {
            workload_id: self.id,
            name: self.spec.name.clone(),
            model: self.spec.model.clone(),
            qos: self.spec.qos,
            resources: self.spec.resources,
            phase: self.phase,
            convergence: convergence_of(self.phase, self.observed_generation),
            generation: self.generation,
            observed_generation: self.observed_generation,
            desired_replicas: self.desired_replicas,
            current_replicas: self.live().count() as u32,
            ready_replicas: self.instances.values().filter(|i| i.is_serving()).count() as u32,
            instances: instances
                .into_iter()
                .map(|i| InstanceStatus {
                    instance_id: i.id,
                    phase: i.phase,
                    node_id: i.node.clone(),
                    reason: i.reason.clone(),
                    created_at: i.created_at,
                    last_transition_at: i.transitioned_at,
                })
                .collect(),
            last_error: self.last_error.clone(),
            sla_at_risk: self.sla_at_risk,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn convergence_of(phase: WorkloadPhase, observed_generation: u64) -> ConvergenceStatus {
    match phase {
        _ if observed_generation == 0 => ConvergenceStatus::Unknown,
        WorkloadPhase::Running | WorkloadPhase::Terminated => ConvergenceStatus::Converged,
        WorkloadPhase::Failed => ConvergenceStatus::Diverged,
        _ => ConvergenceStatus::Converging,
    }
}

// =============================================================================
// Status views
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub phase: InstancePhase,
    pub node_id: Option<NodeId>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub workload_id: WorkloadId,
    pub name: String,
    pub model: ModelRef,
    pub qos: QosClass,
    pub resources: ResourceRequest,
    pub phase: WorkloadPhase,
    pub convergence: ConvergenceStatus,
    pub generation: u64,
    pub observed_generation: u64,
    pub desired_replicas: u32,
    /// Instances that are neither terminating nor finished.
    pub current_replicas: u32,
    pub ready_replicas: u32,
    pub instances: Vec<InstanceStatus>,
    pub last_error: Option<String>,
    pub sla_at_risk: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkloadStatus {
    pub fn instances_in(&self, phase: InstancePhase) -> impl Iterator<Item = &InstanceStatus> {
        self.instances.iter().filter(move |i| i.phase == phase)
    }
}

/// Selects workloads in `list`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadFilter {
    pub phase: Option<WorkloadPhase>,
    pub qos: Option<QosClass>,
    pub model_name: Option<String>,
}

impl WorkloadFilter {
    pub fn matches(&self, status: &WorkloadStatus) -> bool {
        self.phase.is_none_or(|p| p == status.phase)
            && self.qos.is_none_or(|q| q == status.qos)
            && self
                .model_name
                .as_deref()
                .is_none_or(|name| name == status.model.name)
    }
}

// =============================================================================
// Store
// =============================================================================

pub(crate) struct WorkloadSlot {
    pub record: tokio::sync::Mutex<WorkloadRecord>,
    status: ArcSwap<WorkloadStatus>,
}

impl WorkloadSlot {
    pub fn status(&self) -> Arc<WorkloadStatus> {
        self.status.load_full()
    }

    pub fn publish(&self, record: &WorkloadRecord) {
        self.status.store(Arc::new(record.status()));
    }
}

#[derive(Default)]
pub(crate) struct WorkloadStore {
    slots: DashMap<WorkloadId, Arc<WorkloadSlot>>,
    /// Live workload names. A name is freed once its workload terminates.
    names: DashMap<String, WorkloadId>,
    evictions: Mutex<BTreeMap<WorkloadId, BTreeSet<InstanceId>>>,
    migrations: Mutex<BTreeMap<WorkloadId, Vec<MigrationRecommendation>>>,
}

impl WorkloadStore {
    /// Claims the name and stores the record.
    pub fn insert(&self, record: WorkloadRecord) -> Result<Arc<WorkloadSlot>, WorkloadRecord> {
        match self.names.entry(record.spec.name.clone()) {
            Entry::Occupied(_) => return Err(record),
            Entry::Vacant(vacant) => {
                vacant.insert(record.id);
            }
        }
        let id = record.id;
        let slot = Arc::new(WorkloadSlot {
            status: ArcSwap::from_pointee(record.status()),
            record: tokio::sync::Mutex::new(record),
        });
        self.slots.insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    pub fn get(&self, id: &WorkloadId) -> Option<Arc<WorkloadSlot>> {
        self.slots.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn ids(&self) -> Vec<WorkloadId> {
        let mut ids: Vec<_> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn statuses(&self) -> Vec<Arc<WorkloadStatus>> {
        self.ids()
            .iter()
            .filter_map(|id| self.get(id))
            .map(|slot| slot.status())
            .collect()
    }

    /// Moves a live name to a renamed workload. Fails if taken by another.
    pub fn rename(&self, id: WorkloadId, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        match self.names.entry(to.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }
        self.names.remove_if(from, |_, owner| *owner == id);
        true
    }

    pub fn release_name(&self, id: WorkloadId, name: &str) {
        self.names.remove_if(name, |_, owner| *owner == id);
    }

    pub fn request_eviction(&self, workload: WorkloadId, instance: InstanceId) {
        self.evictions.lock().entry(workload).or_default().insert(instance);
    }

    pub fn take_evictions(&self, workload: &WorkloadId) -> BTreeSet<InstanceId> {
        self.evictions.lock().remove(workload).unwrap_or_default()
    }

    pub fn enqueue_migration(&self, rec: MigrationRecommendation) {
        let mut queue = self.migrations.lock();
        let pending = queue.entry(rec.workload_id).or_default();
        if !pending.iter().any(|p| p.instance_id == rec.instance_id) {
            pending.push(rec);
        }
    }

    pub fn take_migrations(&self, workload: &WorkloadId) -> Vec<MigrationRecommendation> {
        self.migrations.lock().remove(workload).unwrap_or_default()
    }
}
