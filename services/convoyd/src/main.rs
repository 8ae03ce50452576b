//! convoy daemon
//!
//! Runs one host agent and, optionally, one leader candidate in a single
//! process. The coordinator is in-memory and the container runtime is the
//! mock runtime; both stand in for the external services in dev mode.
//!
//! ## Architecture
//!
//! - **Host Reconciler**: converges the containers of this host with its assignments
//! - **Cluster Leader**: places service instances on pool hosts while elected
//! - **Snapshot Drain**: labels snapshot requests while elected

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use convoy_coord::{Coordinator, MemoryCoordinator};
use convoy_host_agent::{HostReconciler, MockRuntime};
use convoy_scheduler::{ClusterLeader, LabelSnapshotter, RandomPlacement};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod seed;

/// Upper bound on the wait for the leader to stop after shutdown.
const LEADER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy daemon");
    info!(
        host_id = %config.host_id,
        pool_id = ?config.pool_id,
        leader_candidate = config.leader_candidate,
        seed_file = ?config.seed_file,
        "Configuration loaded"
    );

    let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());

    if let Some(path) = &config.seed_file {
        seed::Seed::load(path)?.apply(coord.as_ref()).await?;
    }

    // Create the runtime (mock for now)
    let runtime = Arc::new(MockRuntime::new());

    // Start the host agent
    let agent = HostReconciler::spawn(config.agent_config(), Arc::clone(&coord), runtime);

    // Start the leader candidate
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let leader_handle = if config.leader_candidate {
        let leader = ClusterLeader::new(
            config.leader_config(),
            Arc::clone(&coord),
            Arc::new(RandomPlacement),
            Arc::new(LabelSnapshotter::new(Arc::clone(&coord))),
        );
        Some(tokio::spawn(leader.run(shutdown_rx)))
    } else {
        None
    };

    // Wait for shutdown signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Stop the host agent; returns once every instance worker has finished
    if let Err(e) = agent.shutdown().await {
        error!(error = %e, "Host agent shutdown failed");
    }

    // Signal the leader and give it a bounded time to drain its watchers
    let _ = shutdown_tx.send(true);
    if let Some(handle) = leader_handle {
        match tokio::time::timeout(LEADER_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("Leader candidate exited"),
            Ok(Err(e)) => error!(error = %e, "Leader task panicked"),
            Err(_) => warn!(
                timeout_secs = LEADER_SHUTDOWN_TIMEOUT.as_secs(),
                "Leader did not stop in time"
            ),
        }
    }

    info!("convoy daemon shutdown complete");
    Ok(())
}
