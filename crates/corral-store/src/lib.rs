//! corral-store — replicated state store contract for Corral.
//!
//! All desired cluster state (nodes, containers) lives in a watchable
//! key-value store consumed through the [`KvStore`] trait. Two adapters
//! are provided: [`MemoryKv`] (tests, standalone demos) and [`EtcdKv`]
//! (production, backed by etcd).
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into the store's byte values.
//! [`ClusterStore`] is the typed layer on top of a `KvStore`: one
//! CRUD method set per entity, with keys built by [`keys`]. Successful
//! creates and deletes additionally emit a [`ClusterEvent`] on the
//! injected [`EventBus`] — an in-process, best-effort trigger channel,
//! distinct from the store's own watch mechanism.
//!
//! `ClusterStore` is `Clone` + `Send` + `Sync` (backed by `Arc<dyn KvStore>`)
//! and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod keys;
pub mod kv;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use events::{ClusterEvent, EventBus};
pub use kv::{EtcdKv, KvChange, KvStore, MemoryKv};
pub use store::ClusterStore;
pub use types::*;
