//! Interfaces to the systems the control core drives but does not own.
//!
//! Collaborators return `anyhow::Result` because their failure modes are
//! open-ended; components convert failures into their own typed errors at
//! the boundary. Every call is made through [`call_with_deadline`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kiln_events::EventEnvelope;
use kiln_id::{InstanceId, NodeId, WorkloadId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{Allocation, MetricSamples, ModelRef, NodeCapacity, ResourceRequest};

// =============================================================================
// Runtime control
// =============================================================================

/// Everything the runtime needs to launch one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLaunch {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub model: ModelRef,
    pub artifact_location: String,
    pub resources: ResourceRequest,
    /// GPU device indices reserved on the node.
    pub gpu_devices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Still booting or not observable right now.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub status: HealthStatus,
    #[serde(default)]
    pub metrics: MetricSamples,
}

impl InstanceHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            metrics: MetricSamples::new(),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            metrics: MetricSamples::new(),
        }
    }
}

/// Starts and stops instance processes.
#[async_trait]
pub trait RuntimeControl: Send + Sync {
    async fn start_instance(&self, launch: &InstanceLaunch, node: &NodeId) -> anyhow::Result<()>;

    /// Stops an instance. Stopping an unknown instance succeeds.
    async fn stop_instance(&self, instance: &InstanceId) -> anyhow::Result<()>;

    async fn health_of(&self, instance: &InstanceId) -> anyhow::Result<InstanceHealth>;
}

// =============================================================================
// Cluster metrics
// =============================================================================

/// A node as reported by the cluster API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub capacity: NodeCapacity,
    pub ready: bool,
    #[serde(default)]
    pub cached_models: Vec<ModelRef>,
    /// Allocation the cluster itself accounts to the node, if it reports one.
    #[serde(default)]
    pub reported_allocation: Option<Allocation>,
}

impl NodeInfo {
    /// A ready node with nothing cached and no reported allocation.
    pub fn new(id: NodeId, capacity: NodeCapacity) -> Self {
        Self {
            id,
            capacity,
            ready: true,
            cached_models: Vec::new(),
            reported_allocation: None,
        }
    }
}

/// Observed utilization fractions (0.0 to 1.0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
}

impl NodeUtilization {
    pub fn peak(&self) -> f64 {
        self.cpu.max(self.memory).max(self.gpu)
    }
}

#[async_trait]
pub trait ClusterMetrics: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>>;

    async fn node_utilization(&self, node: &NodeId) -> anyhow::Result<NodeUtilization>;
}

// =============================================================================
// Artifact storage and benchmarking
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    /// Lowercase hex SHA-256 of the artifact.
    pub sha256: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn fetch_checksum(&self, location: &str) -> anyhow::Result<ArtifactDigest>;

    async fn trigger_transfer(&self, location: &str, target: &NodeId) -> anyhow::Result<()>;
}

/// Raw numbers reported by a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMeasurement {
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    /// Requests per second per unit of reserved resource.
    pub throughput_per_unit: f64,
}

#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    async fn run(&self, model: &ModelRef, location: &str) -> anyhow::Result<BenchmarkMeasurement>;
}

// =============================================================================
// Node heartbeats and events
// =============================================================================

/// Receives the models each node reports as cached locally.
pub trait ModelHeartbeat: Send + Sync {
    fn record_cached_models(&self, node: &NodeId, models: &[ModelRef]);

    fn forget_node(&self, node: &NodeId);
}

/// External sink for structured events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventEnvelope);
}

// =============================================================================
// Deadlines
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CallError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }
}

/// Runs a collaborator call under the caller's cancellation token and a
/// timeout. Cancellation wins over a result that is ready at the same time.
pub async fn call_with_deadline<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> Result<T, CallError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Failed(e)),
            Err(_) => Err(CallError::TimedOut(timeout)),
        },
    }
}
