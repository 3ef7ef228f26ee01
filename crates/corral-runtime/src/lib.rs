//! corral-runtime — the container runtime driver seam.
//!
//! The execution backend (containerd) is an external collaborator:
//! Corral consumes it strictly through the [`RuntimeDriver`] trait —
//! create, start, stop, remove, list, inspect, plus an async lifecycle
//! event stream. The reconciler is written against this trait;
//! [`FakeRuntime`] implements the full lifecycle semantics in memory
//! for tests and demos.

pub mod driver;
pub mod error;
pub mod fake;

pub use driver::{ContainerHandle, CreateSpec, RuntimeDriver, RuntimeEvent};
pub use error::{RuntimeError, RuntimeResult};
pub use fake::FakeRuntime;
