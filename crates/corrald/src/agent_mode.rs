//! Agent mode — runs on worker nodes.
//!
//! In this mode, the daemon:
//! 1. Opens the cluster store and registers this node if unknown
//! 2. Builds the volume and network provisioners over the host tools
//! 3. Runs the runtime event listener (observed status writer)
//! 4. Ticks the reconciler until Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use corral_agent::{
    NetworkConfig, NetworkProvisioner, Reconciler, ReconcilerConfig, SystemExec,
    VolumeProvisioner, run_runtime_event_listener,
};
use corral_runtime::{FakeRuntime, RuntimeDriver};
use corral_store::Node;

use crate::AgentArgs;

/// Run the node agent until Ctrl-C.
pub async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    info!(node_id = %args.node_id, "Corral daemon starting in agent mode");
    std::fs::create_dir_all(&args.storage_root)?;

    let store = crate::open_store(&args.store).await?;
    info!(in_memory = args.store.in_memory, "cluster store opened");

    // ── Node registration ────────────────────────────────────────
    if store.get_node(&args.node_id).await?.is_none() {
        let node = Node {
            id: args.node_id.clone(),
            ip: args.node_ip.clone(),
            cpu_limit: args.cpu_limit,
            memory_limit: args.memory_limit,
            storage_limit: args.storage_limit,
            containers: Vec::new(),
        };
        store.put_node(&node).await?;
        info!(node_id = %args.node_id, ip = %args.node_ip, "node registered");
    }

    // ── Provisioners ─────────────────────────────────────────────
    let exec = Arc::new(SystemExec) as Arc<dyn corral_agent::Exec>;
    let volumes = VolumeProvisioner::new(&args.storage_root, exec.clone());
    let network = NetworkProvisioner::new(
        NetworkConfig {
            cni_bin: args.cni_bin.clone(),
            netns_dir: args.netns_dir.clone(),
            ..NetworkConfig::default()
        },
        exec,
    );
    info!(storage_root = %args.storage_root.display(), "provisioners initialized");

    // ── Runtime driver ───────────────────────────────────────────
    // TODO: wire a containerd-backed RuntimeDriver; the in-memory
    // runtime keeps agent mode runnable end to end until then.
    let runtime = Arc::new(FakeRuntime::new()) as Arc<dyn RuntimeDriver>;

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_shutdown = shutdown_rx.clone();

    // ── Background tasks ─────────────────────────────────────────
    let listener_handle = tokio::spawn(run_runtime_event_listener(
        store.clone(),
        args.store.namespace.clone(),
        runtime.clone(),
        listener_shutdown,
    ));

    let reconciler = Reconciler::new(
        ReconcilerConfig {
            node_id: args.node_id.clone(),
            namespace: args.store.namespace.clone(),
            interval: Duration::from_secs(args.reconcile_interval),
        },
        store,
        runtime,
        volumes,
        network,
    );
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconciler_handle.await;
    let _ = listener_handle.await;
    info!(node_id = %args.node_id, "Corral agent stopped");
    Ok(())
}
