//! Migration planning.
//!
//! Plans are computed on copies of the node ledgers, and every proposed
//! move is applied to those copies before the next one is considered, so a
//! batch of recommendations is consistent with itself.

use std::collections::{BTreeMap, BTreeSet};

use kiln_events::InfeasibleConstraint;
use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::Serialize;

use super::ledger::{NodeLedger, ReservationEntry};
use crate::config::ResourceManagerConfig;
use crate::types::ResourceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    /// The source node's GPUs are split into gaps too small for pending work.
    Fragmentation,
    /// The source node is above the high watermark.
    Overload,
}

impl std::fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationReason::Fragmentation => f.write_str("fragmentation"),
            MigrationReason::Overload => f.write_str("overload"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecommendation {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reason: MigrationReason,
}

pub(crate) struct Planner<'a> {
    pub config: &'a ResourceManagerConfig,
    pub overcommit: f64,
    /// Healthy nodes only.
    pub ledgers: BTreeMap<NodeId, NodeLedger>,
}

impl Planner<'_> {
    pub fn plan(mut self, pending: &[ResourceRequest]) -> Vec<MigrationRecommendation> {
        let mut moved = BTreeSet::new();
        let mut plan = Vec::new();

        let nodes: Vec<NodeId> = self.ledgers.keys().cloned().collect();
        for node in &nodes {
            if self.is_fragmented(node, pending) {
                if let Some(rec) = self.relocate_gpu_work(node, &moved) {
                    moved.insert(rec.instance_id);
                    plan.push(rec);
                }
            }
        }
        for node in &nodes {
            let overloaded = self
                .ledgers
                .get(node)
                .is_some_and(|l| l.allocation_fraction() > self.config.high_watermark);
            if overloaded {
                if let Some(rec) = self.offload(node, &moved) {
                    moved.insert(rec.instance_id);
                    plan.push(rec);
                }
            }
        }
        plan
    }

    /// Above the fragmentation threshold and, when GPU work is pending,
    /// actually blocking some of it.
    fn is_fragmented(&self, node: &NodeId, pending: &[ResourceRequest]) -> bool {
        let Some(ledger) = self.ledgers.get(node) else {
            return false;
        };
        if ledger.fragmentation() <= self.config.fragmentation_threshold {
            return false;
        }
        let gpu_pending: Vec<_> = pending.iter().filter(|r| r.gpu_count > 0).collect();
        gpu_pending.is_empty()
            || gpu_pending.iter().any(|r| {
                ledger
                    .fit(r, self.overcommit)
                    .is_err_and(|c| c.contains(&InfeasibleConstraint::GpuFragmented))
            })
    }

    /// Moves the smallest GPU reservation to a node where it does not add
    /// fragmentation.
    fn relocate_gpu_work(
        &mut self,
        source: &NodeId,
        moved: &BTreeSet<InstanceId>,
    ) -> Option<MigrationRecommendation> {
        let mut candidates: Vec<ReservationEntry> = self
            .ledgers
            .get(source)?
            .reservations()
            .filter(|e| !e.reservation.gpus.is_empty() && !moved.contains(&e.claim.instance_id))
            .cloned()
            .collect();
        candidates.sort_by_key(|e| {
            let gpu_bytes: u64 = e.reservation.gpus.iter().map(|g| g.memory_bytes).sum();
            (gpu_bytes, e.claim.instance_id)
        });

        for entry in candidates {
            let target = self
                .ledgers
                .iter()
                .filter(|(id, _)| *id != source)
                .filter_map(|(id, ledger)| {
                    let gpus = ledger.fit(&entry.claim.request, self.overcommit).ok()?;
                    (ledger.fragmentation_with(&gpus) <= ledger.fragmentation())
                        .then(|| (ledger.fragmentation_with(&gpus), id.clone()))
                })
                .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
                .map(|(_, id)| id);

            if let Some(target) = target {
                return self.apply(source, &target, entry, MigrationReason::Fragmentation);
            }
        }
        None
    }

    /// Moves the smallest reservation to the least loaded under-utilized
    /// node that stays under the high watermark afterwards.
    fn offload(
        &mut self,
        source: &NodeId,
        moved: &BTreeSet<InstanceId>,
    ) -> Option<MigrationRecommendation> {
        let mut candidates: Vec<ReservationEntry> = self
            .ledgers
            .get(source)?
            .reservations()
            .filter(|e| !moved.contains(&e.claim.instance_id))
            .cloned()
            .collect();
        candidates.sort_by_key(|e| {
            (
                e.claim.request.gpu_count,
                e.claim.request.cpu_millis,
                e.claim.request.memory_bytes,
                e.claim.instance_id,
            )
        });

        let mut targets: Vec<(f64, NodeId)> = self
            .ledgers
            .iter()
            .filter(|(id, l)| *id != source && l.allocation_fraction() < self.config.low_watermark)
            .map(|(id, l)| (l.allocation_fraction(), id.clone()))
            .collect();
        targets.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for entry in candidates {
            for (_, target) in &targets {
                let Some(ledger) = self.ledgers.get(target) else {
                    continue;
                };
                let mut trial = ledger.clone();
                let fits = trial
                    .reserve(&entry.claim, self.overcommit, entry.created_at)
                    .is_ok();
                if fits && trial.allocation_fraction() <= self.config.high_watermark {
                    return self.apply(source, target, entry, MigrationReason::Overload);
                }
            }
        }
        None
    }

    fn apply(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        entry: ReservationEntry,
        reason: MigrationReason,
    ) -> Option<MigrationRecommendation> {
        self.ledgers
            .get_mut(target)?
            .reserve(&entry.claim, self.overcommit, entry.created_at)
            .ok()?;
        if let Some(ledger) = self.ledgers.get_mut(source) {
            ledger.release(&entry.claim.instance_id);
        }
        Some(MigrationRecommendation {
            instance_id: entry.claim.instance_id,
            workload_id: entry.claim.workload_id,
            from_node: source.clone(),
            to_node: target.clone(),
            reason,
        })
    }
}
