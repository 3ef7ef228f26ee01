//! Domain types for the Corral cluster state.
//!
//! Nodes and containers are the persisted entities; everything else
//! (usage, volumes, network bindings) is derived at read time from
//! authoritative sources and never cached.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a container.
///
/// Doubles as the runtime container ID, the storage volume ID, and the
/// network namespace name — a single join key across subsystems.
pub type ContainerId = String;

// ── Node ──────────────────────────────────────────────────────────

/// A worker node and its capacity limits.
///
/// The `containers` list is the authoritative assignment map; usage is
/// derived by summing the assigned containers' limits at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub ip: String,
    /// CPU capacity in cores.
    pub cpu_limit: u64,
    /// Memory capacity in GiB.
    pub memory_limit: u64,
    /// Storage capacity in GiB.
    pub storage_limit: u64,
    /// Containers assigned to this node, in assignment order.
    #[serde(default)]
    pub containers: Vec<ContainerId>,
}

/// Derived resource usage for a node. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeUsage {
    pub cpu: u64,
    pub memory: u64,
    pub storage: u64,
}

impl Node {
    /// Compute this node's usage from the full container set.
    ///
    /// Only containers present in the node's `containers` list count.
    pub fn usage(&self, all: &[Container]) -> NodeUsage {
        let mut usage = NodeUsage::default();
        for container in all {
            if self.containers.iter().any(|id| *id == container.id) {
                usage.cpu += container.cpu_limit;
                usage.memory += container.memory_limit;
                usage.storage += container.storage_limit;
            }
        }
        usage
    }

    /// Host ports already claimed by containers assigned to this node.
    pub fn claimed_host_ports(&self, all: &[Container]) -> Vec<u16> {
        all.iter()
            .filter(|c| self.containers.iter().any(|id| *id == c.id))
            .flat_map(|c| c.ports.iter().map(|p| p.host_port))
            .collect()
    }
}

// ── Container ─────────────────────────────────────────────────────

/// Desired specification plus observed status for one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: ContainerId,
    /// Namespace the container belongs to (keying only, no isolation).
    pub namespace: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// CPU limit in cores.
    pub cpu_limit: u64,
    /// Memory limit in GiB.
    pub memory_limit: u64,
    /// Storage (volume) limit in GiB.
    pub storage_limit: u64,
    /// Seconds to wait for graceful stop before force-killing.
    pub stop_timeout_secs: u64,
    /// Assigned node; empty string means unscheduled.
    #[serde(default)]
    pub node_id: NodeId,
    pub desired_status: DesiredStatus,
    /// Observed status. Written only by the reconciler/runtime-event
    /// path, never by API callers.
    #[serde(default)]
    pub status: ContainerStatus,
}

impl Container {
    /// Whether the scheduler has assigned this container to a node.
    pub fn is_scheduled(&self) -> bool {
        !self.node_id.is_empty()
    }
}

/// Operator-declared target status for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

/// Observed runtime status for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    #[default]
    Unknown,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ── Ports ─────────────────────────────────────────────────────────

/// A host ↔ container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Transport protocol for a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

// ── Volume ────────────────────────────────────────────────────────

/// A loopback-backed storage volume, one-to-one with a container.
///
/// Existence is derived from the storage root's directory listing;
/// there is no durable volume record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: ContainerId,
    pub mount_point: PathBuf,
    pub size_limit_gb: u64,
}
