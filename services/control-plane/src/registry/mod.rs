//! Model registry.
//!
//! The registry is the catalog of verified model artifacts. It is
//! responsible for:
//! - Verifying artifact checksums before an entry becomes usable
//! - Recording benchmark results (latency and throughput per resource unit)
//! - Aggregating which nodes cache which models, for placement affinity
//! - Refusing to delete entries that active workloads still reference
//!
//! The registry has no dependency on other core components. Nodes push
//! their cached models in through [`ModelHeartbeat`].

mod catalog;
mod error;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use kiln_events::{
    AggregateType, EventPayload, ModelBenchmarkedPayload, ModelDeletedPayload,
    ModelRegisteredPayload, ModelStatus,
};
use kiln_id::{NodeId, WorkloadId};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use catalog::{BenchmarkResult, CatalogEntry};
pub use error::{RegistryError, RegistryResult};

use crate::collaborators::{
    call_with_deadline, ArtifactStorage, BenchmarkRunner, CallError, ModelHeartbeat,
};
use crate::config::RegistryConfig;
use crate::events::EventRecorder;
use crate::types::ModelRef;
use catalog::{CacheIndex, Catalog};

/// What the scheduler needs to know about a model for one placement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityView {
    pub nodes_caching: BTreeSet<NodeId>,
    /// False when the entry is unbenchmarked; placement then scores on
    /// resources only.
    pub enabled: bool,
}

pub struct ModelRegistry {
    config: RegistryConfig,
    storage: Arc<dyn ArtifactStorage>,
    runner: Arc<dyn BenchmarkRunner>,
    events: Arc<EventRecorder>,
    catalog: RwLock<Catalog>,
    caches: RwLock<CacheIndex>,
    sequence: AtomicU64,
}

impl ModelRegistry {
    pub fn new(
        config: RegistryConfig,
        storage: Arc<dyn ArtifactStorage>,
        runner: Arc<dyn BenchmarkRunner>,
        events: Arc<EventRecorder>,
    ) -> Self {
        Self {
            config,
            storage,
            runner,
            events,
            catalog: RwLock::new(Catalog::default()),
            caches: RwLock::new(CacheIndex::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Registers a new model version after verifying its checksum.
    ///
    /// Nothing is inserted unless the checksum reported by storage matches
    /// `expected_checksum`.
    #[instrument(skip(self, cancel), fields(model = %format_args!("{name}:{version}")))]
    pub async fn register(
        &self,
        name: &str,
        version: &str,
        location: &str,
        expected_checksum: &str,
        cancel: &CancellationToken,
    ) -> RegistryResult<CatalogEntry> {
        let model = ModelRef::new(name, version);
        if name.is_empty() || version.is_empty() || location.is_empty() {
            return Err(RegistryError::InvalidInput(
                "name, version and location are required".to_string(),
            ));
        }
        let expected = normalize_checksum(expected_checksum);
        if expected.len() != 64 || !expected.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidInput(format!(
                "expected checksum '{expected_checksum}' is not a sha256 hex digest"
            )));
        }

        if self.catalog.read().entries.contains_key(&model) {
            return Err(RegistryError::DuplicateVersion(model));
        }

        let digest = self
            .with_storage_retries(location, cancel, || self.storage.fetch_checksum(location))
            .await?;
        let actual = normalize_checksum(&digest.sha256);
        if actual != expected {
            warn!(expected = %expected, actual = %actual, "Checksum mismatch, rejecting registration");
            return Err(RegistryError::ChecksumMismatch {
                model,
                expected,
                actual,
            });
        }

        let entry = {
            let mut catalog = self.catalog.write();
            // A concurrent registration may have won while storage was queried
            if catalog.entries.contains_key(&model) {
                return Err(RegistryError::DuplicateVersion(model));
            }
            let entry = CatalogEntry {
                model: model.clone(),
                location: location.to_string(),
                checksum: actual.clone(),
                size_bytes: digest.size_bytes,
                status: ModelStatus::Unbenchmarked,
                benchmark: None,
                registered_at: Utc::now(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            };
            catalog.entries.insert(model.clone(), entry.clone());
            entry
        };

        info!(size_bytes = entry.size_bytes, "Model registered");
        self.events.emit(
            AggregateType::Model,
            model.to_string(),
            EventPayload::ModelRegistered(ModelRegisteredPayload {
                model_name: model.name.clone(),
                version: model.version.clone(),
                checksum: entry.checksum.clone(),
                size_bytes: entry.size_bytes,
            }),
        );

        if self.config.benchmark_on_register {
            if let Err(e) = self.benchmark(&model, cancel).await {
                warn!(error = %e, "Benchmark on register failed, entry stays usable");
            }
            return self.lookup(&model);
        }

        Ok(entry)
    }

    /// Runs a benchmark and stores the result, replacing any previous one.
    ///
    /// A failure never touches a stored result. An entry with no stored
    /// result is flagged [`ModelStatus::BenchmarkFailed`].
    #[instrument(skip(self, cancel), fields(model = %model))]
    pub async fn benchmark(
        &self,
        model: &ModelRef,
        cancel: &CancellationToken,
    ) -> RegistryResult<BenchmarkResult> {
        let location = self.lookup(model)?.location;

        let outcome = call_with_deadline(
            cancel,
            self.config.benchmark_timeout,
            self.runner.run(model, &location),
        )
        .await;

        let measurement = match outcome {
            Ok(m) => m,
            Err(CallError::Cancelled) => return Err(RegistryError::Cancelled),
            Err(e) => {
                let reason = e.to_string();
                let status = {
                    let mut catalog = self.catalog.write();
                    let entry = catalog
                        .entries
                        .get_mut(model)
                        .ok_or_else(|| RegistryError::NotFound(model.clone()))?;
                    if entry.benchmark.is_none() {
                        entry.status = ModelStatus::BenchmarkFailed;
                    }
                    entry.status
                };
                warn!(error = %reason, status = ?status, "Benchmark failed");
                self.emit_benchmarked(model, status, None, Some(reason.clone()));
                return Err(RegistryError::BenchmarkFailed {
                    model: model.clone(),
                    reason,
                });
            }
        };

        let result = BenchmarkResult::from_measurement(measurement);
        {
            let mut catalog = self.catalog.write();
            let entry = catalog
                .entries
                .get_mut(model)
                .ok_or_else(|| RegistryError::NotFound(model.clone()))?;
            entry.benchmark = Some(result.clone());
            entry.status = ModelStatus::Benchmarked;
        }

        info!(
            latency_p50_ms = result.latency_p50_ms,
            throughput_per_unit = result.throughput_per_unit,
            "Benchmark recorded"
        );
        self.emit_benchmarked(model, ModelStatus::Benchmarked, Some(&result), None);
        Ok(result)
    }

    pub fn lookup(&self, model: &ModelRef) -> RegistryResult<CatalogEntry> {
        self.catalog
            .read()
            .entries
            .get(model)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(model.clone()))
    }

    /// All entries ordered by name, then registration order.
    pub fn list(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<_> = self.catalog.read().entries.values().cloned().collect();
        entries.sort_by(|a, b| a.model.name.cmp(&b.model.name).then(a.sequence.cmp(&b.sequence)));
        entries
    }

    /// The most recently registered version of `name`.
    pub fn latest_version(&self, name: &str) -> Option<CatalogEntry> {
        self.catalog
            .read()
            .entries
            .values()
            .filter(|e| e.model.name == name)
            .max_by_key(|e| e.sequence)
            .cloned()
    }

    pub fn nodes_caching(&self, model: &ModelRef) -> BTreeSet<NodeId> {
        self.caches.read().nodes_caching(model)
    }

    pub fn affinity(&self, model: &ModelRef) -> AffinityView {
        let enabled = self
            .catalog
            .read()
            .entries
            .get(model)
            .is_some_and(CatalogEntry::affinity_enabled);
        AffinityView {
            nodes_caching: self.nodes_caching(model),
            enabled,
        }
    }

    /// Deletes an entry that no active workload references.
    #[instrument(skip(self), fields(model = %model))]
    pub fn delete(&self, model: &ModelRef) -> RegistryResult<()> {
        {
            let mut catalog = self.catalog.write();
            if !catalog.entries.contains_key(model) {
                return Err(RegistryError::NotFound(model.clone()));
            }
            let workloads = catalog.users(model);
            if workloads > 0 {
                return Err(RegistryError::InUse {
                    model: model.clone(),
                    workloads,
                });
            }
            catalog.entries.remove(model);
            catalog.usage.remove(model);
        }

        info!("Model deleted");
        self.events.emit(
            AggregateType::Model,
            model.to_string(),
            EventPayload::ModelDeleted(ModelDeletedPayload {
                model_name: model.name.clone(),
                version: model.version.clone(),
            }),
        );
        Ok(())
    }

    /// Records that `workload` references `model`. Fails if the entry does
    /// not exist, which keeps delete and acquire linearized.
    pub fn acquire(&self, model: &ModelRef, workload: WorkloadId) -> RegistryResult<CatalogEntry> {
        let mut catalog = self.catalog.write();
        let entry = catalog
            .entries
            .get(model)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(model.clone()))?;
        catalog.usage.entry(model.clone()).or_default().insert(workload);
        Ok(entry)
    }

    pub fn release(&self, model: &ModelRef, workload: WorkloadId) {
        let mut catalog = self.catalog.write();
        if let Some(users) = catalog.usage.get_mut(model) {
            users.remove(&workload);
            if users.is_empty() {
                catalog.usage.remove(model);
            }
        }
    }

    /// Triggers a transfer of `model` to `node` unless the node already
    /// reports it cached. Returns whether a transfer was triggered.
    #[instrument(skip(self, cancel), fields(model = %model, node_id = %node))]
    pub async fn ensure_cached(
        &self,
        model: &ModelRef,
        node: &NodeId,
        cancel: &CancellationToken,
    ) -> RegistryResult<bool> {
        if self.caches.read().is_cached_on(model, node) {
            return Ok(false);
        }
        let location = self.lookup(model)?.location;
        self.with_storage_retries(&location, cancel, || {
            self.storage.trigger_transfer(&location, node)
        })
        .await?;
        debug!("Artifact transfer triggered");
        Ok(true)
    }

    /// Retries a storage call with exponential backoff, up to the
    /// configured number of attempts.
    async fn with_storage_retries<T, F, Fut>(
        &self,
        location: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.config.storage_attempts.max(1);
        let mut reason = String::new();

        for attempt in 0..attempts {
            match call_with_deadline(cancel, self.config.call_timeout, op()).await {
                Ok(value) => return Ok(value),
                Err(CallError::Cancelled) => return Err(RegistryError::Cancelled),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Artifact storage call failed");
                    reason = e.to_string();
                }
            }

            if attempt + 1 < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                    _ = tokio::time::sleep(self.config.storage_backoff.delay(attempt)) => {}
                }
            }
        }

        Err(RegistryError::StorageUnreachable {
            location: location.to_string(),
            attempts,
            reason,
        })
    }

    fn emit_benchmarked(
        &self,
        model: &ModelRef,
        status: ModelStatus,
        result: Option<&BenchmarkResult>,
        error: Option<String>,
    ) {
        self.events.emit(
            AggregateType::Model,
            model.to_string(),
            EventPayload::ModelBenchmarked(ModelBenchmarkedPayload {
                model_name: model.name.clone(),
                version: model.version.clone(),
                status,
                latency_ms: result.map(|r| r.latency_p50_ms),
                throughput_per_unit: result.map(|r| r.throughput_per_unit),
                error,
            }),
        );
    }
}

impl ModelHeartbeat for ModelRegistry {
    fn record_cached_models(&self, node: &NodeId, models: &[ModelRef]) {
        self.caches.write().replace(node, models);
    }

    fn forget_node(&self, node: &NodeId) {
        self.caches.write().forget(node);
    }
}

fn normalize_checksum(raw: &str) -> String {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    hex.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{FixedBenchmarkRunner, InMemoryStorage, RecordingEventSink};
    use std::time::Duration;

    struct Harness {
        registry: ModelRegistry,
        storage: Arc<InMemoryStorage>,
        runner: Arc<FixedBenchmarkRunner>,
        sink: Arc<RecordingEventSink>,
    }

    fn harness(config: RegistryConfig) -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let runner = Arc::new(FixedBenchmarkRunner::default());
        let sink = Arc::new(RecordingEventSink::default());
        let registry = ModelRegistry::new(
            config,
            storage.clone(),
            runner.clone(),
            Arc::new(EventRecorder::new(sink.clone())),
        );
        Harness {
            registry,
            storage,
            runner,
            sink,
        }
    }

    const LOCATION: &str = "s3://models/llama2/v2";

    #[tokio::test]
    async fn test_register_verifies_checksum_and_inserts() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"llama2 weights");
        let cancel = CancellationToken::new();

        let entry = h
            .registry
            .register("llama2", "v2", LOCATION, &format!("sha256:{checksum}"), &cancel)
            .await
            .unwrap();

        assert_eq!(entry.status, ModelStatus::Unbenchmarked);
        assert_eq!(entry.size_bytes, 14);
        assert_eq!(h.registry.lookup(&ModelRef::new("llama2", "v2")).unwrap(), entry);
        assert_eq!(h.sink.event_types(), vec!["model.registered"]);
    }

    #[tokio::test]
    async fn test_register_wrong_checksum_creates_nothing() {
        let h = harness(RegistryConfig::default());
        h.storage.put(LOCATION, b"llama2 weights");
        let wrong = "0".repeat(64);

        let err = h
            .registry
            .register("llama2", "v2", LOCATION, &wrong, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::ChecksumMismatch { .. }));
        assert!(matches!(
            h.registry.lookup(&ModelRef::new("llama2", "v2")),
            Err(RegistryError::NotFound(_))
        ));
        assert!(h.sink.event_types().is_empty());
    }

    #[tokio::test]
    async fn test_register_duplicate_version_rejected() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        let cancel = CancellationToken::new();
        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap();

        let err = h
            .registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateVersion(_)));
        assert!(err.is_input_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_outage_reports_after_bounded_attempts() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        h.storage.fail_next(10);

        let err = h
            .registry
            .register("llama2", "v2", LOCATION, &checksum, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            RegistryError::StorageUnreachable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.storage.checksum_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_recovers_within_budget() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        h.storage.fail_next(2);

        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.storage.checksum_calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_benchmark_leaves_entry_usable() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        let cancel = CancellationToken::new();
        let model = ModelRef::new("llama2", "v2");
        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap();
        h.runner.set_failing(true);

        let err = h.registry.benchmark(&model, &cancel).await.unwrap_err();

        assert!(matches!(err, RegistryError::BenchmarkFailed { .. }));
        let entry = h.registry.lookup(&model).unwrap();
        assert_eq!(entry.status, ModelStatus::BenchmarkFailed);
        assert!(!h.registry.affinity(&model).enabled);
    }

    #[tokio::test]
    async fn test_benchmark_rerun_overwrites_and_failure_keeps_result() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        let cancel = CancellationToken::new();
        let model = ModelRef::new("llama2", "v2");
        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap();

        h.registry.benchmark(&model, &cancel).await.unwrap();
        h.runner.set_latency(42.0);
        let second = h.registry.benchmark(&model, &cancel).await.unwrap();
        assert_eq!(second.latency_p50_ms, 42.0);

        h.runner.set_failing(true);
        assert!(h.registry.benchmark(&model, &cancel).await.is_err());
        let entry = h.registry.lookup(&model).unwrap();
        assert_eq!(entry.status, ModelStatus::Benchmarked);
        assert_eq!(entry.benchmark.unwrap().latency_p50_ms, 42.0);
    }

    #[tokio::test]
    async fn test_benchmark_on_register_failure_does_not_fail_registration() {
        let h = harness(RegistryConfig {
            benchmark_on_register: true,
            ..RegistryConfig::default()
        });
        let checksum = h.storage.put(LOCATION, b"weights");
        h.runner.set_failing(true);

        let entry = h
            .registry
            .register("llama2", "v2", LOCATION, &checksum, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entry.status, ModelStatus::BenchmarkFailed);
    }

    #[tokio::test]
    async fn test_delete_refused_while_in_use() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        let model = ModelRef::new("llama2", "v2");
        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &CancellationToken::new())
            .await
            .unwrap();
        let workload = WorkloadId::new();
        h.registry.acquire(&model, workload).unwrap();

        assert!(matches!(
            h.registry.delete(&model),
            Err(RegistryError::InUse { workloads: 1, .. })
        ));

        h.registry.release(&model, workload);
        h.registry.delete(&model).unwrap();
        assert!(h.registry.lookup(&model).is_err());
        assert!(h.registry.acquire(&model, workload).is_err());
    }

    #[tokio::test]
    async fn test_latest_version_and_listing() {
        let h = harness(RegistryConfig::default());
        let cancel = CancellationToken::new();
        for (name, version) in [("llama2", "v1"), ("mistral", "v1"), ("llama2", "v2")] {
            let location = format!("s3://models/{name}/{version}");
            let checksum = h.storage.put(&location, version.as_bytes());
            h.registry
                .register(name, version, &location, &checksum, &cancel)
                .await
                .unwrap();
        }

        assert_eq!(h.registry.latest_version("llama2").unwrap().model.version, "v2");
        assert!(h.registry.latest_version("gpt").is_none());
        let listed: Vec<String> = h.registry.list().iter().map(|e| e.model.to_string()).collect();
        assert_eq!(listed, vec!["llama2:v1", "llama2:v2", "mistral:v1"]);
    }

    #[tokio::test]
    async fn test_heartbeats_drive_affinity() {
        let h = harness(RegistryConfig::default());
        let checksum = h.storage.put(LOCATION, b"weights");
        let cancel = CancellationToken::new();
        let model = ModelRef::new("llama2", "v2");
        h.registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap();
        h.registry.benchmark(&model, &cancel).await.unwrap();

        let gpu1 = NodeId::parse("gpu-1").unwrap();
        h.registry.record_cached_models(&gpu1, &[model.clone()]);

        let view = h.registry.affinity(&model);
        assert!(view.enabled);
        assert!(view.nodes_caching.contains(&gpu1));

        assert!(!h.registry.ensure_cached(&model, &gpu1, &cancel).await.unwrap());
        let gpu2 = NodeId::parse("gpu-2").unwrap();
        assert!(h.registry.ensure_cached(&model, &gpu2, &cancel).await.unwrap());
        assert_eq!(h.storage.transfers(), vec![(LOCATION.to_string(), gpu2)]);
    }

    #[tokio::test]
    async fn test_cancelled_registration_inserts_nothing() {
        let h = harness(RegistryConfig {
            call_timeout: Duration::from_secs(1),
            ..RegistryConfig::default()
        });
        let checksum = h.storage.put(LOCATION, b"weights");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .registry
            .register("llama2", "v2", LOCATION, &checksum, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled));
        assert!(h.registry.list().is_empty());
    }
}
