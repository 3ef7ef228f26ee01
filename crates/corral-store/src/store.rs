//! ClusterStore — typed CRUD over the KvStore contract.
//!
//! One method set per entity, JSON values, keys from [`crate::keys`].
//! First-time puts and deletes emit [`ClusterEvent`]s on the injected
//! bus; plain updates do not, so patching a container's `node_id` never
//! re-triggers scheduling.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::events::{ClusterEvent, EventBus};
use crate::keys;
use crate::kv::{KvChange, KvStore};
use crate::types::{Container, ContainerStatus, Node};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe typed view of the cluster state store.
#[derive(Clone)]
pub struct ClusterStore {
    kv: Arc<dyn KvStore>,
    events: EventBus,
}

impl ClusterStore {
    pub fn new(kv: Arc<dyn KvStore>, events: EventBus) -> Self {
        Self { kv, events }
    }

    /// The event bus this store emits on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Nodes ─────────────────────────────────────────────────────

    /// Insert or update a node. Emits `NodeAdded` only on first insert.
    pub async fn put_node(&self, node: &Node) -> StoreResult<()> {
        let key = keys::node_key(&node.id);
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let is_new = self.kv.get(&key).await?.is_none();
        self.kv.put(&key, value).await?;
        debug!(%key, is_new, "node stored");
        if is_new {
            self.events.emit(ClusterEvent::NodeAdded(Box::new(node.clone())));
        }
        Ok(())
    }

    /// Get a node by ID.
    pub async fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        match self.kv.get(&keys::node_key(id)).await? {
            Some(bytes) => {
                let node = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes, in key order.
    pub async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let entries = self.kv.list_prefix(keys::NODE_PREFIX).await?;
        entries
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .collect()
    }

    /// Delete a node. Returns true if it existed.
    pub async fn delete_node(&self, id: &str) -> StoreResult<bool> {
        let existed = self.kv.delete(&keys::node_key(id)).await?;
        if existed {
            debug!(%id, "node deleted");
            self.events.emit(ClusterEvent::NodeRemoved(id.to_string()));
        }
        Ok(existed)
    }

    // ── Containers ────────────────────────────────────────────────

    /// Insert or update a container. Emits `ContainerAdded` only on
    /// first insert — this is the scheduler's trigger.
    pub async fn put_container(&self, container: &Container) -> StoreResult<()> {
        let key = keys::container_key(&container.namespace, &container.id);
        let value = serde_json::to_vec(container).map_err(map_err!(Serialize))?;
        let is_new = self.kv.get(&key).await?.is_none();
        self.kv.put(&key, value).await?;
        debug!(%key, is_new, "container stored");
        if is_new {
            self.events
                .emit(ClusterEvent::ContainerAdded(Box::new(container.clone())));
        }
        Ok(())
    }

    /// Get a container by namespace and ID.
    pub async fn get_container(&self, namespace: &str, id: &str) -> StoreResult<Option<Container>> {
        match self.kv.get(&keys::container_key(namespace, id)).await? {
            Some(bytes) => {
                let container = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                Ok(Some(container))
            }
            None => Ok(None),
        }
    }

    /// List all containers in a namespace, in key order.
    pub async fn list_containers(&self, namespace: &str) -> StoreResult<Vec<Container>> {
        let entries = self.kv.list_prefix(&keys::container_prefix(namespace)).await?;
        entries
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .collect()
    }

    /// Delete a container: detach it from its node's assignment list
    /// first, then delete the record. Returns true if it existed.
    pub async fn delete_container(&self, namespace: &str, id: &str) -> StoreResult<bool> {
        if let Some(container) = self.get_container(namespace, id).await?
            && container.is_scheduled()
            && let Some(mut node) = self.get_node(&container.node_id).await?
        {
            node.containers.retain(|c| c != id);
            self.put_node(&node).await?;
        }

        let existed = self.kv.delete(&keys::container_key(namespace, id)).await?;
        if existed {
            debug!(%namespace, %id, "container deleted");
            self.events.emit(ClusterEvent::ContainerRemoved(id.to_string()));
        }
        Ok(existed)
    }

    /// Patch a container's observed status.
    ///
    /// This is the runtime-event path — the only writer of `status`.
    pub async fn update_container_status(
        &self,
        namespace: &str,
        id: &str,
        status: ContainerStatus,
    ) -> StoreResult<()> {
        let mut container = self
            .get_container(namespace, id)
            .await?
            .ok_or_else(|| StoreError::ContainerNotFound(id.to_string()))?;
        container.status = status;
        self.put_container(&container).await
    }

    /// Watch a single container's record for changes.
    pub async fn watch_container(
        &self,
        namespace: &str,
        id: &str,
    ) -> StoreResult<mpsc::Receiver<KvChange>> {
        self.kv.watch(&keys::container_key(namespace, id)).await
    }
}
