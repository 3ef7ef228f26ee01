//! corrald — the Corral daemon.
//!
//! One binary, two modes:
//! - `control-plane`: owns the scheduler loop, binding unscheduled
//!   containers to nodes as they appear in the store.
//! - `agent`: runs on a worker node, reconciling that node's compute,
//!   storage, and network state against the store every tick.
//!
//! Both modes talk to the same replicated store (etcd, or an in-memory
//! store for single-process demos).
//!
//! # Usage
//!
//! ```text
//! corrald control-plane --etcd-endpoints http://127.0.0.1:2379
//! corrald agent --node-id worker-1 --node-ip 10.0.0.11
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use corral_store::{ClusterStore, EtcdKv, EventBus, KvStore, MemoryKv};

mod agent_mode;
mod control_plane;

#[derive(Parser)]
#[command(name = "corrald", about = "Corral daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (scheduler loop).
    ControlPlane(ControlPlaneArgs),

    /// Run the node agent (per-node reconciler).
    Agent(AgentArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// etcd endpoints for the cluster state store.
    #[arg(long, default_value = "http://127.0.0.1:2379", num_args = 1.., value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Use an in-process store instead of etcd (single-process demos).
    #[arg(long)]
    in_memory: bool,

    /// Container namespace to operate in.
    #[arg(long, default_value = corral_store::keys::DEFAULT_NAMESPACE)]
    namespace: String,
}

#[derive(Args)]
struct ControlPlaneArgs {
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args)]
struct AgentArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Unique identifier of this node in the cluster.
    #[arg(long)]
    node_id: String,

    /// Address other nodes reach this node at.
    #[arg(long)]
    node_ip: String,

    /// CPU capacity advertised for scheduling (cores).
    #[arg(long, default_value = "4")]
    cpu_limit: u64,

    /// Memory capacity advertised for scheduling (GiB).
    #[arg(long, default_value = "8")]
    memory_limit: u64,

    /// Storage capacity advertised for scheduling (GiB).
    #[arg(long, default_value = "100")]
    storage_limit: u64,

    /// Root directory for container volumes.
    #[arg(long, default_value = "/var/lib/corral/volumes")]
    storage_root: PathBuf,

    /// Seconds between reconciliation ticks.
    #[arg(long, default_value = "5")]
    reconcile_interval: u64,

    /// CNI plugin binary.
    #[arg(long, default_value = "/opt/cni/bin/bridge")]
    cni_bin: PathBuf,

    /// OS network namespace registry directory.
    #[arg(long, default_value = "/var/run/netns")]
    netns_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,corrald=debug,corral=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::ControlPlane(args) => control_plane::run_control_plane(args).await,
        Command::Agent(args) => agent_mode::run_agent(args).await,
    }
}

/// Open the cluster store per the shared store flags.
async fn open_store(args: &StoreArgs) -> anyhow::Result<ClusterStore> {
    let kv: Arc<dyn KvStore> = if args.in_memory {
        Arc::new(MemoryKv::new())
    } else {
        Arc::new(EtcdKv::connect(&args.etcd_endpoints).await?)
    };
    Ok(ClusterStore::new(kv, EventBus::new()))
}
