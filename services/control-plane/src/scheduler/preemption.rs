//! Preemption policies.
//!
//! A policy looks at one node's ledger and names the lower-QoS instances
//! whose removal would let a request fit. It never evicts anything itself;
//! the scheduler returns the plan and the reconciler carries it out through
//! the owning workloads.

use std::cmp::Reverse;

use kiln_events::QosClass;
use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::Serialize;

use super::filter::PlacementRequest;
use crate::config::PreemptionMode;
use crate::resources::{NodeLedger, ReservationEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Victim {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub qos: QosClass,
}

impl Victim {
    fn of(entry: &ReservationEntry) -> Self {
        Self {
            instance_id: entry.claim.instance_id,
            workload_id: entry.claim.workload_id,
            qos: entry.claim.qos,
        }
    }
}

/// Victims on one node plus the disruption their eviction causes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VictimPlan {
    pub victims: Vec<Victim>,
    pub cost: f64,
}

/// The node to clear and what to evict from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreemptionPlan {
    pub node: NodeId,
    pub victims: Vec<Victim>,
    pub cost: f64,
}

pub trait PreemptionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Victims on `ledger` whose release lets `request` fit, or `None`.
    fn select_victims(
        &self,
        ledger: &NodeLedger,
        request: &PlacementRequest,
        overcommit: f64,
    ) -> Option<VictimPlan>;
}

pub fn policy_for(mode: PreemptionMode) -> Box<dyn PreemptionPolicy> {
    match mode {
        PreemptionMode::Disabled => Box::new(Disabled),
        PreemptionMode::LowestQosFirst => Box::new(LowestQosFirst),
        PreemptionMode::CostAware => Box::new(CostAware),
    }
}

// =============================================================================
// Policies
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl PreemptionPolicy for Disabled {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn select_victims(&self, _: &NodeLedger, _: &PlacementRequest, _: f64) -> Option<VictimPlan> {
        None
    }
}

/// Evicts the lowest QoS class first and, within a class, the most
/// recently placed instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestQosFirst;

impl PreemptionPolicy for LowestQosFirst {
    fn name(&self) -> &'static str {
        "lowest_qos_first"
    }

    fn select_victims(
        &self,
        ledger: &NodeLedger,
        request: &PlacementRequest,
        overcommit: f64,
    ) -> Option<VictimPlan> {
        let mut candidates = preemptible(ledger, request.qos);
        candidates.sort_by_key(|e| (e.claim.qos, Reverse(e.created_at), e.claim.instance_id));
        release_until_fit(ledger, request, overcommit, &candidates)
    }
}

/// Minimizes disruption: a single cheapest victim if one suffices,
/// otherwise the cheapest victims in turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostAware;

impl PreemptionPolicy for CostAware {
    fn name(&self) -> &'static str {
        "cost_aware"
    }

    fn select_victims(
        &self,
        ledger: &NodeLedger,
        request: &PlacementRequest,
        overcommit: f64,
    ) -> Option<VictimPlan> {
        let mut candidates = preemptible(ledger, request.qos);
        candidates.sort_by(|a, b| {
            victim_cost(ledger, a)
                .total_cmp(&victim_cost(ledger, b))
                .then_with(|| a.claim.instance_id.cmp(&b.claim.instance_id))
        });

        let single = candidates.iter().find(|entry| {
            let mut trial = ledger.clone();
            trial.release(&entry.claim.instance_id);
            trial.fit(&request.request, overcommit).is_ok()
        });
        if let Some(entry) = single {
            return Some(VictimPlan {
                victims: vec![Victim::of(entry)],
                cost: victim_cost(ledger, entry),
            });
        }
        release_until_fit(ledger, request, overcommit, &candidates)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn preemptible(ledger: &NodeLedger, qos: QosClass) -> Vec<&ReservationEntry> {
    ledger.reservations().filter(|e| e.claim.qos < qos).collect()
}

/// Releases candidates in order on a copy of the ledger until the request
/// fits.
fn release_until_fit(
    ledger: &NodeLedger,
    request: &PlacementRequest,
    overcommit: f64,
    candidates: &[&ReservationEntry],
) -> Option<VictimPlan> {
    let mut trial = ledger.clone();
    let mut plan = VictimPlan {
        victims: Vec::new(),
        cost: 0.0,
    };
    for entry in candidates {
        trial.release(&entry.claim.instance_id);
        plan.victims.push(Victim::of(entry));
        plan.cost += victim_cost(ledger, entry);
        if trial.fit(&request.request, overcommit).is_ok() {
            return Some(plan);
        }
    }
    None
}

/// QoS weight times the share of the node the victim occupies. Every
/// eviction costs at least its QoS weight.
fn victim_cost(ledger: &NodeLedger, entry: &ReservationEntry) -> f64 {
    let weight = match entry.claim.qos {
        QosClass::Basic => 1.0,
        QosClass::Standard => 2.0,
        QosClass::Premium => 4.0,
    };
    let capacity = ledger.capacity();
    let share = |used: u64, total: u64| {
        if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        }
    };
    let size = share(entry.reservation.cpu_millis, capacity.cpu_millis)
        .max(share(entry.reservation.memory_bytes, capacity.memory_bytes))
        .max(share(entry.reservation.gpus.len() as u64, u64::from(capacity.gpu_count)));
    weight * (1.0 + size)
}
