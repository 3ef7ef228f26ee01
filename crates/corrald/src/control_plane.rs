//! Control-plane mode — runs the scheduler loop.
//!
//! In this mode, the daemon:
//! 1. Opens the cluster store
//! 2. Runs the scheduler (startup pass + event-triggered passes)
//! 3. Shuts down gracefully on Ctrl-C

use tokio::sync::watch;
use tracing::info;

use corral_scheduler::Scheduler;

use crate::ControlPlaneArgs;

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(args: ControlPlaneArgs) -> anyhow::Result<()> {
    info!("Corral daemon starting in control-plane mode");

    let store = crate::open_store(&args.store).await?;
    info!(in_memory = args.store.in_memory, "cluster store opened");

    let scheduler = Scheduler::new(store, &args.store.namespace);
    info!(namespace = %args.store.namespace, "scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    info!("Corral control plane stopped");
    Ok(())
}
