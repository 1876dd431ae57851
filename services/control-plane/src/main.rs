//! kiln Control Plane
//!
//! Runs the placement and lifecycle core against the in-process cluster,
//! runtime and storage collaborators until interrupted.

use std::sync::Arc;

use anyhow::Result;
use kiln_control_plane::{api::ControlPlane, config, dev::StaticCluster};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to KILN_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kiln control plane");
    info!(
        reconcile_workers = config.workers.reconcile_workers,
        overcommit_ratio = config.resources.overcommit_ratio,
        preemption = ?config.scheduler.preemption,
        "Configuration loaded"
    );

    let shutdown_timeout = config.workers.shutdown_grace;
    let control_plane = ControlPlane::builder(config)
        .cluster(Arc::new(StaticCluster::dev_cluster()?))
        .build();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = control_plane.spawn_workers(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for (name, handle) in handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(worker = name, error = %e, "Worker did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
