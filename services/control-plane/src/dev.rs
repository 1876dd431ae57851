//! In-memory collaborator implementations.
//!
//! These back the development binary and the test suites. Production
//! deployments plug real cluster, runtime and storage clients into the same
//! traits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use kiln_events::EventEnvelope;
use kiln_id::{InstanceId, NodeId, WorkloadId};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::collaborators::{
    ArtifactDigest, ArtifactStorage, BenchmarkMeasurement, BenchmarkRunner, ClusterMetrics,
    EventSink, HealthStatus, InstanceHealth, InstanceLaunch, NodeInfo, NodeUtilization,
    RuntimeControl,
};
use crate::types::{Allocation, MetricSamples, ModelRef, NodeCapacity};

/// Takes one unit from a "fail the next N calls" counter.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Runtime
// =============================================================================

#[derive(Debug, Clone)]
struct Launched {
    workload_id: WorkloadId,
    node: NodeId,
}

/// Runtime that tracks launched instances in memory.
///
/// Instances are healthy once started unless marked otherwise. Metric
/// samples are set per workload and reported by each of its instances.
#[derive(Debug, Default)]
pub struct MockRuntime {
    running: RwLock<BTreeMap<InstanceId, Launched>>,
    stopped: Mutex<Vec<InstanceId>>,
    starts: AtomicU64,
    fail_starts: AtomicU32,
    failing_nodes: RwLock<BTreeSet<NodeId>>,
    unhealthy: RwLock<BTreeSet<InstanceId>>,
    metrics: RwLock<BTreeMap<WorkloadId, MetricSamples>>,
    start_delay: Mutex<Option<Duration>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` start calls.
    pub fn fail_next_starts(&self, n: u32) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    /// Fails every start on `node` until cleared.
    pub fn fail_starts_on(&self, node: &NodeId, failing: bool) {
        let mut nodes = self.failing_nodes.write();
        if failing {
            nodes.insert(node.clone());
        } else {
            nodes.remove(node);
        }
    }

    pub fn set_unhealthy(&self, instance: InstanceId, unhealthy: bool) {
        let mut set = self.unhealthy.write();
        if unhealthy {
            set.insert(instance);
        } else {
            set.remove(&instance);
        }
    }

    pub fn set_workload_metrics(&self, workload: WorkloadId, samples: MetricSamples) {
        self.metrics.write().insert(workload, samples);
    }

    /// Delays every start call, for exercising timeouts and cancellation.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        *self.start_delay.lock() = delay;
    }

    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn running_instances(&self) -> Vec<InstanceId> {
        self.running.read().keys().copied().collect()
    }

    pub fn running_on(&self, node: &NodeId) -> Vec<InstanceId> {
        self.running
            .read()
            .iter()
            .filter(|(_, l)| &l.node == node)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn stopped_instances(&self) -> Vec<InstanceId> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl RuntimeControl for MockRuntime {
    async fn start_instance(&self, launch: &InstanceLaunch, node: &NodeId) -> anyhow::Result<()> {
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.fail_starts) {
            bail!("runtime rejected start of {}", launch.instance_id);
        }
        if self.failing_nodes.read().contains(node) {
            bail!("runtime on {node} is unavailable");
        }

        self.running.write().insert(
            launch.instance_id,
            Launched {
                workload_id: launch.workload_id,
                node: node.clone(),
            },
        );
        Ok(())
    }

    async fn stop_instance(&self, instance: &InstanceId) -> anyhow::Result<()> {
        if self.running.write().remove(instance).is_some() {
            self.stopped.lock().push(*instance);
        }
        Ok(())
    }

    async fn health_of(&self, instance: &InstanceId) -> anyhow::Result<InstanceHealth> {
        let Some(launched) = self.running.read().get(instance).cloned() else {
            return Ok(InstanceHealth {
                status: HealthStatus::Unknown,
                metrics: MetricSamples::new(),
            });
        };
        let status = if self.unhealthy.read().contains(instance) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        let metrics = self
            .metrics
            .read()
            .get(&launched.workload_id)
            .cloned()
            .unwrap_or_default();
        Ok(InstanceHealth { status, metrics })
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// A fixed set of nodes that tests can mutate between refreshes.
#[derive(Debug, Default)]
pub struct StaticCluster {
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
    utilization: RwLock<BTreeMap<NodeId, NodeUtilization>>,
    failing: AtomicBool,
}

impl StaticCluster {
    pub fn new(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.id.clone(), n)).collect()),
            ..Self::default()
        }
    }

    /// Two GPU nodes and one CPU node, used by the development binary.
    pub fn dev_cluster() -> anyhow::Result<Self> {
        const GIB: u64 = 1024 * 1024 * 1024;
        let gpu = NodeCapacity {
            cpu_millis: 32_000,
            memory_bytes: 256 * GIB,
            gpu_count: 4,
            gpu_memory_bytes: 80 * GIB,
        };
        let cpu = NodeCapacity {
            cpu_millis: 16_000,
            memory_bytes: 64 * GIB,
            gpu_count: 0,
            gpu_memory_bytes: 0,
        };
        Ok(Self::new([
            NodeInfo::new(NodeId::parse("gpu-a")?, gpu),
            NodeInfo::new(NodeId::parse("gpu-b")?, gpu),
            NodeInfo::new(NodeId::parse("cpu-a")?, cpu),
        ]))
    }

    pub fn upsert_node(&self, node: NodeInfo) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub fn remove_node(&self, node: &NodeId) {
        self.nodes.write().remove(node);
    }

    pub fn set_ready(&self, node: &NodeId, ready: bool) {
        if let Some(info) = self.nodes.write().get_mut(node) {
            info.ready = ready;
        }
    }

    pub fn set_cached_models(&self, node: &NodeId, models: Vec<ModelRef>) {
        if let Some(info) = self.nodes.write().get_mut(node) {
            info.cached_models = models;
        }
    }

    pub fn set_reported_allocation(&self, node: &NodeId, allocation: Option<Allocation>) {
        if let Some(info) = self.nodes.write().get_mut(node) {
            info.reported_allocation = allocation;
        }
    }

    pub fn set_utilization(&self, node: &NodeId, utilization: NodeUtilization) {
        self.utilization.write().insert(node.clone(), utilization);
    }

    /// Makes every call fail, as if the cluster API were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterMetrics for StaticCluster {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("cluster API unavailable");
        }
        Ok(self.nodes.read().values().cloned().collect())
    }

    async fn node_utilization(&self, node: &NodeId) -> anyhow::Result<NodeUtilization> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("cluster API unavailable");
        }
        Ok(self.utilization.read().get(node).copied().unwrap_or_default())
    }
}

// =============================================================================
// Storage and benchmarks
// =============================================================================

/// Artifact store keyed by location.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    artifacts: RwLock<BTreeMap<String, ArtifactDigest>>,
    fail_next: AtomicU32,
    checksum_calls: AtomicU32,
    transfers: Mutex<Vec<(String, NodeId)>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` at `location` and returns their hex SHA-256.
    pub fn put(&self, location: &str, bytes: &[u8]) -> String {
        let sha256 = hex::encode(Sha256::digest(bytes));
        self.artifacts.write().insert(
            location.to_string(),
            ArtifactDigest {
                sha256: sha256.clone(),
                size_bytes: bytes.len() as u64,
            },
        );
        sha256
    }

    /// Fails the next `n` calls of either kind.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn checksum_calls(&self) -> u32 {
        self.checksum_calls.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> Vec<(String, NodeId)> {
        self.transfers.lock().clone()
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryStorage {
    async fn fetch_checksum(&self, location: &str) -> anyhow::Result<ArtifactDigest> {
        self.checksum_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_next) {
            bail!("storage endpoint unreachable");
        }
        self.artifacts
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| anyhow!("no artifact at '{location}'"))
    }

    async fn trigger_transfer(&self, location: &str, target: &NodeId) -> anyhow::Result<()> {
        if take_failure(&self.fail_next) {
            bail!("storage endpoint unreachable");
        }
        if !self.artifacts.read().contains_key(location) {
            bail!("no artifact at '{location}'");
        }
        self.transfers
            .lock()
            .push((location.to_string(), target.clone()));
        Ok(())
    }
}

/// Benchmark runner that reports a configurable measurement.
#[derive(Debug)]
pub struct FixedBenchmarkRunner {
    measurement: Mutex<BenchmarkMeasurement>,
    failing: AtomicBool,
}

impl Default for FixedBenchmarkRunner {
    fn default() -> Self {
        Self {
            measurement: Mutex::new(BenchmarkMeasurement {
                latency_p50_ms: 120.0,
                latency_p99_ms: 310.0,
                throughput_per_unit: 42.5,
            }),
            failing: AtomicBool::new(false),
        }
    }
}

impl FixedBenchmarkRunner {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, p50_ms: f64) {
        let mut m = self.measurement.lock();
        m.latency_p50_ms = p50_ms;
        m.latency_p99_ms = m.latency_p99_ms.max(p50_ms);
    }
}

#[async_trait]
impl BenchmarkRunner for FixedBenchmarkRunner {
    async fn run(&self, model: &ModelRef, _location: &str) -> anyhow::Result<BenchmarkMeasurement> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("benchmark harness crashed while loading {model}");
        }
        Ok(*self.measurement.lock())
    }
}

// =============================================================================
// Event sinks
// =============================================================================

/// Writes every event to the log as JSON.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EventEnvelope) {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            payload = %payload,
            "Event"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: EventEnvelope) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceRequest;

    fn launch(workload_id: WorkloadId) -> InstanceLaunch {
        InstanceLaunch {
            instance_id: InstanceId::new(),
            workload_id,
            model: ModelRef::new("llama2", "v2"),
            artifact_location: "s3://models/llama2/v2".to_string(),
            resources: ResourceRequest::cpu(1_000, 1 << 30),
            gpu_devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_runtime_lifecycle() {
        let runtime = MockRuntime::new();
        let node = NodeId::parse("gpu-a").unwrap();
        let l = launch(WorkloadId::new());

        runtime.fail_next_starts(1);
        assert!(runtime.start_instance(&l, &node).await.is_err());
        runtime.start_instance(&l, &node).await.unwrap();
        assert_eq!(runtime.start_count(), 2);
        assert_eq!(
            runtime.health_of(&l.instance_id).await.unwrap().status,
            HealthStatus::Healthy
        );

        runtime.stop_instance(&l.instance_id).await.unwrap();
        runtime.stop_instance(&l.instance_id).await.unwrap();
        assert_eq!(runtime.stopped_instances(), vec![l.instance_id]);
        assert_eq!(
            runtime.health_of(&l.instance_id).await.unwrap().status,
            HealthStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_storage_digest_matches_sha256() {
        let storage = InMemoryStorage::new();
        let checksum = storage.put("s3://a", b"abc");
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let digest = storage.fetch_checksum("s3://a").await.unwrap();
        assert_eq!(digest.size_bytes, 3);
        assert!(storage.fetch_checksum("s3://missing").await.is_err());
    }
}
