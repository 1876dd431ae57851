//! Declarative workload types and resource quantities.

use std::collections::BTreeMap;

use kiln_events::QosClass;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// A model name plus version, e.g. `llama2:v2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Validate)]
pub struct ModelRef {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub version: String,
}

impl ModelRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Resources requested per instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    /// Minimum free memory required on each assigned GPU. Zero means the
    /// whole device.
    pub gpu_memory_bytes: u64,
}

impl ResourceRequest {
    pub fn cpu(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            gpu_count: 0,
            gpu_memory_bytes: 0,
        }
    }

    pub fn with_gpus(mut self, gpu_count: u32, gpu_memory_bytes: u64) -> Self {
        self.gpu_count = gpu_count;
        self.gpu_memory_bytes = gpu_memory_bytes;
        self
    }

    /// Memory needed on each GPU given the node's per-device memory.
    pub fn per_gpu_need(&self, device_memory_bytes: u64) -> u64 {
        if self.gpu_memory_bytes == 0 {
            device_memory_bytes
        } else {
            self.gpu_memory_bytes
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.gpu_count == 0
    }
}

/// Declared capacity of a node. GPUs on one node are homogeneous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub gpu_memory_bytes: u64,
}

/// CPU and memory currently accounted to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpus_in_use: u32,
}

/// A metric tracked by scaling policies and health samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Fraction of the reserved CPU in use (0.0 to 1.0).
    CpuUtilization,
    /// Fraction of the reserved GPU compute in use (0.0 to 1.0).
    GpuUtilization,
    RequestsPerSecond,
    LatencyMs,
    QueueDepth,
}

/// Per-instance metric samples.
pub type MetricSamples = BTreeMap<MetricKind, f64>;

/// High/low watermarks for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_watermarks"))]
pub struct MetricTarget {
    pub metric: MetricKind,
    #[validate(range(min = 0.0))]
    pub high: f64,
    #[validate(range(min = 0.0))]
    pub low: f64,
}

fn validate_watermarks(target: &MetricTarget) -> Result<(), ValidationError> {
    if target.low < target.high {
        Ok(())
    } else {
        Err(ValidationError::new("low_watermark_not_below_high"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_replica_bounds"))]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    #[validate(range(min = 1))]
    pub max_replicas: u32,
    #[validate(nested)]
    pub targets: Vec<MetricTarget>,
}

fn validate_replica_bounds(policy: &ScalingPolicy) -> Result<(), ValidationError> {
    if policy.min_replicas <= policy.max_replicas {
        Ok(())
    } else {
        Err(ValidationError::new("min_replicas_exceeds_max_replicas"))
    }
}

impl ScalingPolicy {
    pub fn fixed(replicas: u32) -> Self {
        Self {
            min_replicas: replicas,
            max_replicas: replicas,
            targets: Vec::new(),
        }
    }

    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

/// Service level objectives declared for a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Sla {
    #[validate(range(min = 0.0))]
    pub max_latency_ms: f64,
    #[validate(range(min = 0.0))]
    pub min_throughput_rps: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub availability_target: f64,
}

impl Default for Sla {
    fn default() -> Self {
        Self {
            max_latency_ms: 1_000.0,
            min_throughput_rps: 0.0,
            availability_target: 0.99,
        }
    }
}

/// The operator-declared desired state of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WorkloadSpec {
    #[validate(length(min = 1, max = 63), custom(function = "validate_workload_name"))]
    pub name: String,
    #[validate(nested)]
    pub model: ModelRef,
    #[validate(custom(function = "validate_resources"))]
    pub resources: ResourceRequest,
    pub qos: QosClass,
    #[validate(nested)]
    pub scaling: ScalingPolicy,
    #[validate(nested)]
    pub sla: Sla,
}

impl WorkloadSpec {
    /// The part of a workload spec that shapes individual instances. Instances
    /// created from a different template are replaced.
    pub fn template(&self) -> InstanceTemplate {
        InstanceTemplate {
            model: self.model.clone(),
            resources: self.resources,
            qos: self.qos,
        }
    }
}

fn validate_workload_name(name: &str) -> Result<(), ValidationError> {
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_characters"))
    }
}

fn validate_resources(request: &ResourceRequest) -> Result<(), ValidationError> {
    if request.is_empty() {
        return Err(ValidationError::new("empty_resource_request"));
    }
    if request.gpu_count == 0 && request.gpu_memory_bytes > 0 {
        return Err(ValidationError::new("gpu_memory_without_gpus"));
    }
    Ok(())
}

/// Instance-shaping subset of a [`WorkloadSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceTemplate {
    pub model: ModelRef,
    pub resources: ResourceRequest,
    pub qos: QosClass,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_valid_spec_passes() {
        assert!(spec("chat-frontend").validate().is_ok());
    }

    #[test]
    fn test_min_above_max_rejected() {
        let mut s = spec("chat");
        s.scaling.min_replicas = 4;
        assert!(s.validate().is_err());
        assert!(s.scaling.validate().is_err());
    }

    #[rstest]
    #[case("")]
    #[case("Upper")]
    #[case("has space")]
    #[case("-leading")]
    fn test_bad_names_rejected(#[case] name: &str) {
        assert!(spec(name).validate().is_err());
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut s = spec("chat");
        s.scaling.targets[0].low = 0.9;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_empty_request_rejected() {
        let mut s = spec("chat");
        s.resources = ResourceRequest::default();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_gpu_floor_means_whole_device() {
        let req = ResourceRequest::cpu(1_000, GIB).with_gpus(1, 0);
        assert_eq!(req.per_gpu_need(80 * GIB), 80 * GIB);
        let req = req.with_gpus(1, 20 * GIB);
        assert_eq!(req.per_gpu_need(80 * GIB), 20 * GIB);
    }

    #[test]
    fn test_policy_clamp() {
        let policy = spec("chat").scaling;
        assert_eq!(policy.clamp(0), 1);
        assert_eq!(policy.clamp(9), 3);
    }
}
