//! RuntimeDriver — the contract the node reconciler drives containers through.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use corral_store::ContainerStatus;

use crate::error::RuntimeResult;

/// Everything the runtime needs to create a container.
///
/// The volume mount point and the network namespace must exist before
/// `create` is called; provisioning order is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub id: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// CPU limit in cores.
    pub cpu_limit: u64,
    /// Memory limit in GiB.
    pub memory_limit: u64,
    /// Host path of the pre-provisioned volume, mounted into the container.
    pub volume_mount: PathBuf,
    /// Path of the pre-provisioned network namespace the container joins.
    pub netns_path: PathBuf,
}

/// A runtime's view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub status: ContainerStatus,
}

/// Asynchronous lifecycle event, keyed by container ID.
///
/// These are the authoritative source for updating a container's
/// observed status in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Started { id: String },
    Exited { id: String, exit_code: i64 },
}

impl RuntimeEvent {
    pub fn container_id(&self) -> &str {
        match self {
            Self::Started { id } | Self::Exited { id, .. } => id,
        }
    }
}

/// Adapter contract to the container execution backend.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Pull the image if needed, apply resource limits, bind the volume
    /// mount and the network namespace, and create the container in a
    /// stopped state.
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<ContainerHandle>;

    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// Graceful-stop with exactly one grace-then-force escalation: send
    /// the stop signal, wait up to `timeout_secs`, force-kill if the
    /// container never responds, and return once the process is reaped.
    async fn stop(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()>;

    /// Remove a container. Only valid once stopped.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    async fn list(&self) -> RuntimeResult<Vec<ContainerHandle>>;

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerStatus>;

    /// Subscribe to the lifecycle event stream.
    async fn subscribe_events(&self) -> mpsc::Receiver<RuntimeEvent>;
}
