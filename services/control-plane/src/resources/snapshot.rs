//! Immutable cluster views published by the refresh loop.

use std::collections::BTreeMap;

use kiln_events::NodeHealth;
use kiln_id::NodeId;
use serde::Serialize;
use tokio::time::Instant;

use crate::collaborators::NodeUtilization;
use crate::types::{Allocation, ModelRef, NodeCapacity};

/// One node as of the last refresh.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub capacity: NodeCapacity,
    /// Ledger allocation when the snapshot was built.
    pub allocated: Allocation,
    pub utilization: NodeUtilization,
    pub cached_models: Vec<ModelRef>,
    pub health: NodeHealth,
    #[serde(skip)]
    pub last_seen: Instant,
    /// Smoothed demand trend (0.0 to 1.0), if enough samples exist.
    pub forecast: Option<f64>,
}

impl NodeView {
    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }
}

/// A fully built cluster view. Replaced wholesale, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// Incremented on every successful refresh.
    pub generation: u64,
    /// Set before the first successful refresh and after a failed one.
    pub stale: bool,
    pub nodes: BTreeMap<NodeId, NodeView>,
}

impl ClusterSnapshot {
    pub fn empty_stale() -> Self {
        Self {
            generation: 0,
            stale: true,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeView> {
        self.nodes.get(id)
    }

    pub fn healthy_nodes(&self) -> impl Iterator<Item = &NodeView> {
        self.nodes.values().filter(|n| n.is_healthy())
    }

    pub fn is_node_healthy(&self, id: &NodeId) -> bool {
        self.nodes.get(id).is_some_and(NodeView::is_healthy)
    }
}

/// Cluster-wide totals over healthy nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub generation: u64,
    pub stale: bool,
    pub healthy_nodes: usize,
    pub unhealthy_nodes: usize,
    pub total_cpu_millis: u64,
    pub total_memory_bytes: u64,
    pub total_gpus: u32,
    pub allocated: Allocation,
    /// Mean of per-node peak utilization.
    pub mean_utilization: f64,
}
