mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cpu_node, fixed, node_id, TestPlane};
use kiln_control_plane::config::{Config, ResourceManagerConfig};
use kiln_control_plane::types::ModelRef;
use kiln_events::{InstancePhase, ModelStatus, WorkloadPhase};
use proptest::prelude::*;
use rstest::rstest;

fn overcommitted(ratio: f64) -> Config {
    Config {
        resources: ResourceManagerConfig {
            overcommit_ratio: ratio,
            ..ResourceManagerConfig::default()
        },
        ..Config::default()
    }
}

#[tokio::test]
async fn test_places_what_fits_and_reports_the_rest() {
    let plane = TestPlane::with_model(Config::default(), vec![cpu_node("node-a", 4_000)]).await;
    let id = plane.cp.submit_workload(fixed("chat", 3, 2_000)).unwrap();

    plane.reconcile(id).await;

    let status = plane.cp.get_workload_status(&id).unwrap();
    assert_eq!(status.phase, WorkloadPhase::Scheduling);
    assert_eq!(status.ready_replicas, 2);
    assert_eq!(status.instances_in(InstancePhase::Running).count(), 2);

    let pending: Vec<_> = status.instances_in(InstancePhase::Pending).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].node_id, None);
    let reason = pending[0].reason.as_deref().unwrap();
    assert!(reason.starts_with("Infeasible"), "{reason}");
    assert!(reason.contains("insufficient cpu"), "{reason}");

    assert_eq!(plane.allocated_cpu("node-a"), 4_000);
    assert_eq!(plane.sink.count("scheduling.failed"), 1);
    assert_eq!(plane.cp.scheduler_metrics().placed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_added_node_unblocks_pending() {
    let plane = TestPlane::with_model(Config::default(), vec![cpu_node("node-a", 4_000)]).await;
    let id = plane.cp.submit_workload(fixed("chat", 3, 2_000)).unwrap();
    plane.reconcile(id).await;

    // Past the scheduling backoff, then a fresh snapshot with the new node
    plane.cluster.upsert_node(cpu_node("node-b", 4_000));
    tokio::time::advance(Duration::from_secs(5)).await;
    plane.cp.refresh_cluster(&plane.cancel).await.unwrap();
    plane.reconcile(id).await;

    let status = plane.cp.get_workload_status(&id).unwrap();
    assert_eq!(status.phase, WorkloadPhase::Running);
    assert_eq!(status.ready_replicas, 3);
    assert_eq!(status.last_error, None);
    assert_eq!(plane.allocated_cpu("node-b"), 2_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_last_slot() {
    let plane = Arc::new(
        TestPlane::with_model(Config::default(), vec![cpu_node("node-a", 2_000)]).await,
    );
    let a = plane.cp.submit_workload(fixed("chat", 1, 2_000)).unwrap();
    let b = plane.cp.submit_workload(fixed("embed", 1, 2_000)).unwrap();

    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|id| {
            let plane = plane.clone();
            tokio::spawn(async move { plane.reconcile(id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let ready: u32 = [a, b]
        .iter()
        .map(|id| plane.cp.get_workload_status(id).unwrap().ready_replicas)
        .sum();
    assert_eq!(ready, 1);
    assert_eq!(plane.allocated_cpu("node-a"), 2_000);
    assert_eq!(plane.runtime.running_instances().len(), 1);
}

#[rstest]
#[case(1.0, 2)]
#[case(1.5, 3)]
#[case(2.0, 4)]
#[tokio::test]
async fn test_overcommit_ratio_bounds_placements(#[case] ratio: f64, #[case] placed: u32) {
    let plane = TestPlane::with_model(overcommitted(ratio), vec![cpu_node("node-a", 4_000)]).await;
    let id = plane.cp.submit_workload(fixed("chat", 5, 2_000)).unwrap();

    plane.reconcile(id).await;

    let status = plane.cp.get_workload_status(&id).unwrap();
    assert_eq!(status.ready_replicas, placed);
    assert_eq!(plane.allocated_cpu("node-a"), u64::from(placed) * 2_000);
}

#[tokio::test]
async fn test_placement_is_deterministic() {
    let nodes = || {
        vec![
            cpu_node("node-a", 6_000),
            cpu_node("node-b", 8_000),
            cpu_node("node-c", 4_000),
        ]
    };
    let workloads = [("chat", 2, 2_000), ("embed", 3, 1_000), ("rank", 1, 3_000)];

    let mut layouts = Vec::new();
    for _ in 0..2 {
        let plane = TestPlane::with_model(Config::default(), nodes()).await;
        let mut layout = Vec::new();
        for (name, replicas, cpu) in workloads {
            let id = plane.cp.submit_workload(fixed(name, replicas, cpu)).unwrap();
            plane.reconcile(id).await;
            let mut placed: Vec<_> = plane
                .cp
                .get_workload_status(&id)
                .unwrap()
                .instances
                .into_iter()
                .filter_map(|i| i.node_id)
                .collect();
            placed.sort();
            layout.push((name, placed));
        }
        layouts.push(layout);
    }

    assert_eq!(layouts[0], layouts[1]);
}

#[tokio::test]
async fn test_registered_model_prefers_caching_node() {
    let mut cached = cpu_node("node-b", 8_000);
    cached.cached_models = vec![ModelRef::new("llama2", "v2")];
    let plane = TestPlane::with_model(Config::default(), vec![cpu_node("node-a", 8_000), cached]).await;
    let entry = plane.cp.get_model(&ModelRef::new("llama2", "v2")).unwrap();
    assert_eq!(entry.status, ModelStatus::Unbenchmarked);

    let id = plane.cp.submit_workload(fixed("chat", 1, 2_000)).unwrap();
    plane.reconcile(id).await;

    let status = plane.cp.get_workload_status(&id).unwrap();
    assert_eq!(status.instances[0].node_id, Some(node_id("node-b")));
    assert_eq!(plane.cp.scheduler_metrics().affinity_hits, 1);
}

#[tokio::test]
async fn test_unhealthy_node_is_never_chosen() {
    let plane = TestPlane::with_model(
        Config::default(),
        vec![cpu_node("node-a", 8_000), cpu_node("node-b", 8_000)],
    )
    .await;
    plane.cluster.set_ready(&node_id("node-a"), false);
    plane.cp.refresh_cluster(&plane.cancel).await.unwrap();

    let id = plane.cp.submit_workload(fixed("chat", 2, 2_000)).unwrap();
    plane.reconcile(id).await;

    let status = plane.cp.get_workload_status(&id).unwrap();
    assert_eq!(status.ready_replicas, 2);
    assert!(status
        .instances
        .iter()
        .all(|i| i.node_id == Some(node_id("node-b"))));
    assert_eq!(plane.allocated_cpu("node-a"), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_ledger_never_exceeds_overcommitted_capacity(
        ratio in 1.0f64..2.0,
        requests in proptest::collection::vec((1u32..4, 250u64..3_000), 1..6),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let capacities = [("node-a", 4_000u64), ("node-b", 6_000u64)];
            let plane = TestPlane::with_model(
                overcommitted(ratio),
                capacities.iter().map(|(n, c)| cpu_node(n, *c)).collect(),
            )
            .await;

            for (i, (replicas, cpu)) in requests.iter().enumerate() {
                let id = plane
                    .cp
                    .submit_workload(fixed(&format!("w{i}"), *replicas, *cpu))
                    .unwrap();
                plane.reconcile(id).await;
            }

            for (name, capacity) in capacities {
                let allowed = (capacity as f64 * ratio).floor() as u64;
                assert!(plane.allocated_cpu(name) <= allowed);
            }
        });
    }
}
