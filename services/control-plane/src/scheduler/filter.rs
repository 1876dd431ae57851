//! Filter and score phases.
//!
//! Ranking is a pure function of the snapshot, the affinity view, the
//! ledger contents and the evaluation instant, so identical inputs always
//! produce the same order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use kiln_events::{InfeasibleConstraint, QosClass};
use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ScoringWeights;
use crate::registry::AffinityView;
use crate::resources::{Claim, ClusterSnapshot, NodeLedger, NodeView, ReservationLedger};
use crate::types::{ModelRef, ResourceRequest};

/// One instance awaiting a node.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub model: ModelRef,
    pub request: ResourceRequest,
    pub qos: QosClass,
}

impl PlacementRequest {
    pub fn claim(&self) -> Claim {
        Claim {
            instance_id: self.instance_id,
            workload_id: self.workload_id,
            qos: self.qos,
            request: self.request,
        }
    }
}

/// Score terms for one node. Terms are unweighted; `total` is the
/// weighted sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub model_affinity: f64,
    pub resource_fit: f64,
    pub qos_isolation: f64,
    pub fragmentation_penalty: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub breakdown: ScoreBreakdown,
    /// Current allocation fraction, the first tie-breaker.
    pub allocation_fraction: f64,
}

/// Why no node survived filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InfeasibilityReport {
    pub nodes_considered: usize,
    pub unhealthy: usize,
    /// Number of healthy nodes rejected by each constraint.
    pub rejections: BTreeMap<InfeasibleConstraint, usize>,
}

impl InfeasibilityReport {
    /// The failing constraints, most specific first.
    pub fn constraints(&self) -> Vec<InfeasibleConstraint> {
        if self.nodes_considered == 0 {
            vec![InfeasibleConstraint::NoNodes]
        } else if self.unhealthy == self.nodes_considered {
            vec![InfeasibleConstraint::AllUnhealthy]
        } else {
            self.rejections.keys().copied().collect()
        }
    }

    fn reject(&mut self, constraints: &[InfeasibleConstraint]) {
        for c in constraints {
            *self.rejections.entry(*c).or_default() += 1;
        }
    }
}

impl std::fmt::Display for InfeasibilityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.nodes_considered == 0 {
            return f.write_str("no nodes");
        }
        if self.unhealthy == self.nodes_considered {
            return write!(f, "all {} nodes unhealthy", self.nodes_considered);
        }
        let parts: Vec<String> = self
            .rejections
            .iter()
            .map(|(c, n)| format!("{c} on {n} node(s)"))
            .collect();
        write!(f, "{}", parts.join(", "))?;
        if self.unhealthy > 0 {
            write!(f, "; {} node(s) unhealthy", self.unhealthy)?;
        }
        Ok(())
    }
}

/// Read-only inputs for one placement.
pub(crate) struct PlacementContext<'a> {
    pub snapshot: &'a ClusterSnapshot,
    pub affinity: &'a AffinityView,
    pub weights: &'a ScoringWeights,
    pub ledger: &'a ReservationLedger,
    /// Holds expiring at or before this instant are ignored.
    pub now: Instant,
}

impl PlacementContext<'_> {
    /// Filters and scores every node. Best candidate first.
    pub fn rank(&self, req: &PlacementRequest) -> Result<Vec<NodeScore>, InfeasibilityReport> {
        let mut report = InfeasibilityReport::default();
        let mut feasible = Vec::new();

        for view in self.snapshot.nodes.values() {
            report.nodes_considered += 1;
            if !view.is_healthy() {
                report.unhealthy += 1;
                continue;
            }
            match self.ledger.view(&view.id, |ledger| self.score(req, view, ledger)) {
                Some(Ok(score)) => feasible.push(score),
                Some(Err(constraints)) => report.reject(&constraints),
                None => report.unhealthy += 1,
            }
        }

        if feasible.is_empty() {
            return Err(report);
        }
        feasible.sort_by(compare);
        Ok(feasible)
    }

    /// Scores a single node, or returns the constraints it fails.
    pub fn score(
        &self,
        req: &PlacementRequest,
        view: &NodeView,
        ledger: &NodeLedger,
    ) -> Result<NodeScore, Vec<InfeasibleConstraint>> {
        let overcommit = self.ledger.overcommit();
        let gpus = ledger.fit_for(&req.workload_id, &req.request, overcommit, self.now)?;
        let w = self.weights;

        let model_affinity = if self.affinity.nodes_caching.contains(&view.id) {
            1.0
        } else {
            0.0
        };
        let affinity_weight = match (self.affinity.enabled, req.qos) {
            (false, _) => 0.0,
            (true, QosClass::Premium) => w.model_affinity * 2.0,
            (true, _) => w.model_affinity,
        };

        let headroom_bias = 1.0 - w.forecast_bias * view.forecast.unwrap_or(0.0).clamp(0.0, 1.0);
        let resource_fit = ledger.fit_ratio(&req.request, overcommit) * headroom_bias;

        let qos_isolation = if req.qos == QosClass::Premium && ledger.hosts_qos(QosClass::Basic) {
            0.0
        } else {
            1.0
        };
        let fragmentation_penalty = ledger.fragmentation_with(&gpus);

        let total = affinity_weight * model_affinity + w.resource_fit * resource_fit
            + w.qos_isolation * qos_isolation
            - w.fragmentation * fragmentation_penalty;

        Ok(NodeScore {
            node_id: view.id.clone(),
            breakdown: ScoreBreakdown {
                model_affinity,
                resource_fit,
                qos_isolation,
                fragmentation_penalty,
                total,
            },
            allocation_fraction: ledger.allocation_fraction(),
        })
    }
}

/// Highest score, then lowest allocation, then lowest node id.
fn compare(a: &NodeScore, b: &NodeScore) -> Ordering {
    b.breakdown
        .total
        .total_cmp(&a.breakdown.total)
        .then_with(|| a.allocation_fraction.total_cmp(&b.allocation_fraction))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(node: &str, total: f64, allocation: f64) -> NodeScore {
        NodeScore {
            node_id: NodeId::parse(node).unwrap(),
            breakdown: ScoreBreakdown {
                total,
                ..ScoreBreakdown::default()
            },
            allocation_fraction: allocation,
        }
    }

    #[test]
    fn test_tie_break_order() {
        let mut scores = vec![
            score("node-c", 5.0, 0.2),
            score("node-b", 5.0, 0.2),
            score("node-a", 5.0, 0.5),
            score("node-d", 7.0, 0.9),
        ];
        scores.sort_by(compare);
        let order: Vec<_> = scores.iter().map(|s| s.node_id.to_string()).collect();
        assert_eq!(order, vec!["node-d", "node-b", "node-c", "node-a"]);
    }

    #[test]
    fn test_report_constraints() {
        let empty = InfeasibilityReport::default();
        assert_eq!(empty.constraints(), vec![InfeasibleConstraint::NoNodes]);

        let unhealthy = InfeasibilityReport {
            nodes_considered: 2,
            unhealthy: 2,
            ..InfeasibilityReport::default()
        };
        assert_eq!(unhealthy.constraints(), vec![InfeasibleConstraint::AllUnhealthy]);

        let mut mixed = InfeasibilityReport {
            nodes_considered: 3,
            unhealthy: 1,
            ..InfeasibilityReport::default()
        };
        mixed.reject(&[InfeasibleConstraint::InsufficientGpu]);
        mixed.reject(&[InfeasibleConstraint::InsufficientCpu, InfeasibleConstraint::InsufficientGpu]);
        assert_eq!(
            mixed.constraints(),
            vec![InfeasibleConstraint::InsufficientCpu, InfeasibleConstraint::InsufficientGpu]
        );
        assert_eq!(
            mixed.to_string(),
            "insufficient cpu on 1 node(s), insufficient gpu on 2 node(s); 1 node(s) unhealthy"
        );
    }
}
