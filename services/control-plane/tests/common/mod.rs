//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use kiln_control_plane::api::ControlPlane;
use kiln_control_plane::collaborators::NodeInfo;
use kiln_control_plane::config::Config;
use kiln_control_plane::dev::{InMemoryStorage, MockRuntime, RecordingEventSink, StaticCluster};
use kiln_control_plane::types::{
    MetricKind, MetricSamples, MetricTarget, ModelRef, NodeCapacity, ResourceRequest,
    ScalingPolicy, Sla, WorkloadSpec,
};
use kiln_events::QosClass;
use kiln_id::NodeId;
use tokio_util::sync::CancellationToken;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MODEL_LOCATION: &str = "s3://models/llama2-v2";

pub struct TestPlane {
    pub cp: ControlPlane,
    pub cluster: Arc<StaticCluster>,
    pub runtime: Arc<MockRuntime>,
    pub storage: Arc<InMemoryStorage>,
    pub sink: Arc<RecordingEventSink>,
    pub checksum: String,
    pub cancel: CancellationToken,
}

impl TestPlane {
    /// A control plane with a refreshed snapshot and no models registered.
    pub async fn new(config: Config, nodes: Vec<NodeInfo>) -> Self {
        let cluster = Arc::new(StaticCluster::new(nodes));
        let runtime = Arc::new(MockRuntime::new());
        let storage = Arc::new(InMemoryStorage::new());
        let checksum = storage.put(MODEL_LOCATION, b"llama2 weights");
        let sink = Arc::new(RecordingEventSink::default());

        let cp = ControlPlane::builder(config)
            .cluster(cluster.clone())
            .runtime(runtime.clone())
            .storage(storage.clone())
            .event_sink(sink.clone())
            .build();
        let cancel = CancellationToken::new();
        cp.refresh_cluster(&cancel).await.unwrap();

        Self {
            cp,
            cluster,
            runtime,
            storage,
            sink,
            checksum,
            cancel,
        }
    }

    /// Same as [`TestPlane::new`] with `llama2:v2` registered.
    pub async fn with_model(config: Config, nodes: Vec<NodeInfo>) -> Self {
        let plane = Self::new(config, nodes).await;
        plane
            .cp
            .register_model("llama2", "v2", MODEL_LOCATION, &plane.checksum, &plane.cancel)
            .await
            .unwrap();
        plane
    }

    pub async fn reconcile(&self, id: kiln_id::WorkloadId) {
        self.cp.reconcile(id, &self.cancel).await.unwrap();
    }

    pub fn allocated_cpu(&self, node: &str) -> u64 {
        self.cp
            .resources()
            .ledger()
            .allocation(&node_id(node))
            .map_or(0, |a| a.cpu_millis)
    }
}

pub fn node_id(name: &str) -> NodeId {
    NodeId::parse(name).unwrap()
}

pub fn cpu_node(name: &str, cpu_millis: u64) -> NodeInfo {
    NodeInfo::new(
        node_id(name),
        NodeCapacity {
            cpu_millis,
            memory_bytes: 64 * GIB,
            gpu_count: 0,
            gpu_memory_bytes: 0,
        },
    )
}

/// An autoscaled workload between 1 and 3 replicas on CPU utilization.
pub fn autoscaled(name: &str) -> WorkloadSpec {
    WorkloadSpec {
        name: name.to_string(),
        model: ModelRef::new("llama2", "v2"),
        resources: ResourceRequest::cpu(2_000, 4 * GIB),
        qos: QosClass::Standard,
        scaling: ScalingPolicy {
            min_replicas: 1,
            max_replicas: 3,
            targets: vec![MetricTarget {
                metric: MetricKind::CpuUtilization,
                high: 0.8,
                low: 0.3,
            }],
        },
        sla: Sla::default(),
    }
}

pub fn fixed(name: &str, replicas: u32, cpu_millis: u64) -> WorkloadSpec {
    WorkloadSpec {
        scaling: ScalingPolicy::fixed(replicas),
        resources: ResourceRequest::cpu(cpu_millis, 4 * GIB),
        ..autoscaled(name)
    }
}

pub fn cpu_samples(value: f64) -> MetricSamples {
    MetricSamples::from([(MetricKind::CpuUtilization, value)])
}
