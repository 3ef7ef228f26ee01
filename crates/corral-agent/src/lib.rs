//! corral-agent — the per-node reconciliation loop.
//!
//! On a fixed interval the [`Reconciler`] fetches this node's desired
//! container set from the state store and converges three independent
//! subsystems toward it: storage (loopback-backed volumes), network
//! (namespaces with CNI-attached interfaces), and compute (runtime
//! containers). Each sync is best-effort: one entity's failure is
//! logged and retried next tick, never fatal to the loop.
//!
//! External commands (mount, mkfs, ip, iptables, the CNI plugin) go
//! through the [`Exec`] seam so provisioner logic is testable without
//! root.

pub mod error;
pub mod exec;
pub mod netns;
pub mod reconciler;
pub mod volume;

pub use error::{AgentError, AgentResult, TeardownReport};
pub use exec::{Cmd, Exec, ExecOutput, SystemExec};
pub use netns::{NetworkConfig, NetworkProvisioner};
pub use reconciler::{Reconciler, ReconcilerConfig, run_runtime_event_listener};
pub use volume::VolumeProvisioner;
