//! Catalog records and the node cache index.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kiln_events::ModelStatus;
use kiln_id::{NodeId, WorkloadId};
use serde::{Deserialize, Serialize};

use crate::collaborators::BenchmarkMeasurement;
use crate::types::ModelRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub throughput_per_unit: f64,
    pub measured_at: DateTime<Utc>,
}

impl BenchmarkResult {
    pub(crate) fn from_measurement(m: BenchmarkMeasurement) -> Self {
        Self {
            latency_p50_ms: m.latency_p50_ms,
            latency_p99_ms: m.latency_p99_ms,
            throughput_per_unit: m.throughput_per_unit,
            measured_at: Utc::now(),
        }
    }
}

/// One verified model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model: ModelRef,
    pub location: String,
    /// Verified lowercase hex SHA-256.
    pub checksum: String,
    pub size_bytes: u64,
    pub status: ModelStatus,
    pub benchmark: Option<BenchmarkResult>,
    pub registered_at: DateTime<Utc>,
    /// Registration order across the whole catalog.
    pub sequence: u64,
}

impl CatalogEntry {
    /// Whether placement may weigh model affinity for this entry.
    pub fn affinity_enabled(&self) -> bool {
        self.status.allows_affinity()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Catalog {
    pub entries: BTreeMap<ModelRef, CatalogEntry>,
    pub usage: BTreeMap<ModelRef, BTreeSet<WorkloadId>>,
}

impl Catalog {
    pub fn users(&self, model: &ModelRef) -> usize {
        self.usage.get(model).map_or(0, BTreeSet::len)
    }
}

/// Which nodes report which models as cached. Both directions are kept so
/// a node's report can replace its previous one.
#[derive(Debug, Default)]
pub(crate) struct CacheIndex {
    by_node: BTreeMap<NodeId, BTreeSet<ModelRef>>,
    by_model: BTreeMap<ModelRef, BTreeSet<NodeId>>,
}

impl CacheIndex {
    pub fn replace(&mut self, node: &NodeId, models: &[ModelRef]) {
        self.forget(node);
        let set: BTreeSet<ModelRef> = models.iter().cloned().collect();
        for model in &set {
            self.by_model
                .entry(model.clone())
                .or_default()
                .insert(node.clone());
        }
        if !set.is_empty() {
            self.by_node.insert(node.clone(), set);
        }
    }

    pub fn forget(&mut self, node: &NodeId) {
        let Some(previous) = self.by_node.remove(node) else {
            return;
        };
        for model in previous {
            if let Some(nodes) = self.by_model.get_mut(&model) {
                nodes.remove(node);
                if nodes.is_empty() {
                    self.by_model.remove(&model);
                }
            }
        }
    }

    pub fn nodes_caching(&self, model: &ModelRef) -> BTreeSet<NodeId> {
        self.by_model.get(model).cloned().unwrap_or_default()
    }

    pub fn is_cached_on(&self, model: &ModelRef, node: &NodeId) -> bool {
        self.by_model
            .get(model)
            .is_some_and(|nodes| nodes.contains(node))
    }
}
