//! Control plane facade.
//!
//! The facade is responsible for:
//! - Wiring the registry, resource manager, scheduler and reconciler
//! - Validating inbound workload specs before they reach the reconciler
//! - Spawning the background workers that drive convergence

pub mod error;

use std::sync::Arc;

use kiln_id::WorkloadId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use validator::Validate;

pub use error::{ApiError, ApiResult};

use crate::collaborators::{
    ArtifactStorage, BenchmarkRunner, ClusterMetrics, EventSink, RuntimeControl,
};
use crate::config::Config;
use crate::dev::{FixedBenchmarkRunner, InMemoryStorage, MockRuntime, StaticCluster, TracingEventSink};
use crate::events::EventRecorder;
use crate::reconciler::{
    RebalanceWorker, ReconcileOutcome, ReconcileWorker, Reconciler, WorkloadFilter, WorkloadStatus,
};
use crate::registry::{BenchmarkResult, CatalogEntry, ModelRegistry};
use crate::resources::{ClusterSummary, ResourceManager, SnapshotWorker};
use crate::scheduler::{Scheduler, SchedulerMetrics};
use crate::types::{ModelRef, WorkloadSpec};

/// The assembled control plane.
pub struct ControlPlane {
    config: Config,
    registry: Arc<ModelRegistry>,
    resources: Arc<ResourceManager>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
}

impl ControlPlane {
    pub fn builder(config: Config) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            cluster: None,
            runtime: None,
            storage: None,
            benchmark_runner: None,
            event_sink: None,
        }
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Accepts a workload. Placement happens asynchronously.
    pub fn submit_workload(&self, spec: WorkloadSpec) -> ApiResult<WorkloadId> {
        spec.validate()?;
        Ok(self.reconciler.submit(spec)?)
    }

    /// Replaces a workload's spec and returns the new generation.
    pub async fn update_workload(&self, id: WorkloadId, spec: WorkloadSpec) -> ApiResult<u64> {
        spec.validate()?;
        Ok(self.reconciler.update(id, spec).await?)
    }

    pub async fn delete_workload(&self, id: WorkloadId) -> ApiResult<()> {
        Ok(self.reconciler.delete(id).await?)
    }

    pub fn get_workload_status(&self, id: &WorkloadId) -> ApiResult<WorkloadStatus> {
        Ok(self.reconciler.status(id)?)
    }

    pub fn list_workloads(&self, filter: &WorkloadFilter) -> Vec<WorkloadStatus> {
        self.reconciler.list(filter)
    }

    /// Runs one reconcile pass for a workload outside the worker.
    pub async fn reconcile(
        &self,
        id: WorkloadId,
        cancel: &CancellationToken,
    ) -> ApiResult<ReconcileOutcome> {
        Ok(self.reconciler.reconcile_workload(id, cancel).await?)
    }

    // =========================================================================
    // Models
    // =========================================================================

    pub async fn register_model(
        &self,
        name: &str,
        version: &str,
        location: &str,
        checksum: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<CatalogEntry> {
        Ok(self
            .registry
            .register(name, version, location, checksum, cancel)
            .await?)
    }

    pub async fn benchmark_model(
        &self,
        model: &ModelRef,
        cancel: &CancellationToken,
    ) -> ApiResult<BenchmarkResult> {
        Ok(self.registry.benchmark(model, cancel).await?)
    }

    pub fn get_model(&self, model: &ModelRef) -> ApiResult<CatalogEntry> {
        Ok(self.registry.lookup(model)?)
    }

    /// Most recently registered version of a model name.
    pub fn latest_model(&self, name: &str) -> Option<CatalogEntry> {
        self.registry.latest_version(name)
    }

    pub fn list_models(&self) -> Vec<CatalogEntry> {
        self.registry.list()
    }

    /// Removes a model version. Fails while any live workload references it.
    pub fn delete_model(&self, model: &ModelRef) -> ApiResult<()> {
        Ok(self.registry.delete(model)?)
    }

    // =========================================================================
    // Cluster
    // =========================================================================

    /// Refreshes the cluster snapshot immediately.
    pub async fn refresh_cluster(&self, cancel: &CancellationToken) -> ApiResult<()> {
        Ok(self.resources.refresh(cancel).await?)
    }

    pub fn cluster_summary(&self) -> ClusterSummary {
        self.resources.cluster_summary()
    }

    pub fn scheduler_metrics(&self) -> SchedulerMetrics {
        self.scheduler.metrics()
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Spawns the snapshot, reconcile and rebalance workers.
    pub fn spawn_workers(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<(&'static str, JoinHandle<()>)> {
        let snapshot = SnapshotWorker::new(self.resources.clone());
        let snapshot_rx = shutdown.clone();
        let snapshot_handle = tokio::spawn(async move { snapshot.run(snapshot_rx).await });

        let reconcile = ReconcileWorker::new(self.reconciler.clone(), self.config.workers.clone());
        let reconcile_rx = shutdown.clone();
        let reconcile_handle = tokio::spawn(async move { reconcile.run(reconcile_rx).await });

        let rebalance = RebalanceWorker::new(self.reconciler.clone());
        let rebalance_handle = tokio::spawn(async move { rebalance.run(shutdown).await });

        info!("Background workers started");
        vec![
            ("snapshot", snapshot_handle),
            ("reconcile", reconcile_handle),
            ("rebalance", rebalance_handle),
        ]
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane").finish_non_exhaustive()
    }
}

/// Assembles a [`ControlPlane`]. Collaborators not supplied fall back to the
/// in-process implementations from [`crate::dev`].
pub struct ControlPlaneBuilder {
    config: Config,
    cluster: Option<Arc<dyn ClusterMetrics>>,
    runtime: Option<Arc<dyn RuntimeControl>>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    benchmark_runner: Option<Arc<dyn BenchmarkRunner>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl ControlPlaneBuilder {
    pub fn cluster(mut self, cluster: Arc<dyn ClusterMetrics>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeControl>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn ArtifactStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn benchmark_runner(mut self, runner: Arc<dyn BenchmarkRunner>) -> Self {
        self.benchmark_runner = Some(runner);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn build(self) -> ControlPlane {
        let config = self.config;
        let sink = self
            .event_sink
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let events = Arc::new(EventRecorder::new(sink));

        let registry = Arc::new(ModelRegistry::new(
            config.registry.clone(),
            self.storage.unwrap_or_else(|| Arc::new(InMemoryStorage::new())),
            self.benchmark_runner
                .unwrap_or_else(|| Arc::new(FixedBenchmarkRunner::default())),
            events.clone(),
        ));

        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(StaticCluster::new(Vec::new())));
        let resources = Arc::new(
            ResourceManager::new(config.resources.clone(), cluster, events.clone())
                .with_heartbeat(registry.clone()),
        );

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            resources.clone(),
            registry.clone(),
            events.clone(),
        ));

        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(MockRuntime::new()));
        let reconciler = Arc::new(Reconciler::new(
            config.reconciler.clone(),
            registry.clone(),
            resources.clone(),
            scheduler.clone(),
            runtime,
            events,
        ));

        ControlPlane {
            config,
            registry,
            resources,
            scheduler,
            reconciler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::spec;

    #[tokio::test]
    async fn test_submit_rejects_invalid_spec() {
        let cp = ControlPlane::builder(Config::default()).build();
        let mut bad = spec("chat");
        bad.name = "Not_Valid".to_string();

        let err = cp.submit_workload(bad).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(err.code(), "invalid_spec");
        assert!(cp.list_workloads(&WorkloadFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_submit_unknown_model() {
        let cp = ControlPlane::builder(Config::default()).build();
        let err = cp.submit_workload(spec("chat")).unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }

    #[tokio::test]
    async fn test_empty_cluster_summary() {
        let cp = ControlPlane::builder(Config::default()).build();
        cp.refresh_cluster(&CancellationToken::new()).await.unwrap();

        let summary = cp.cluster_summary();
        assert!(!summary.stale);
        assert_eq!(summary.healthy_nodes, 0);
        assert_eq!(cp.scheduler_metrics().attempts, 0);
    }
}
