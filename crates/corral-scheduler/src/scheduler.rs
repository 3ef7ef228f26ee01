//! Scheduler — the control-plane loop that assigns containers to nodes.
//!
//! Level-triggered: one pass at startup, then one per `ContainerAdded`
//! event. A pass lists unscheduled containers and nodes in store order,
//! repairs any half-committed assignment from a previous crash, and
//! first-fit assigns each container. Assignment is two writes (container
//! patch, then node list append) and is not atomic; the repair scan at
//! the start of every pass makes the scheme self-healing.

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use corral_store::{ClusterEvent, ClusterStore, Container, Node};

use crate::error::{ScheduleError, ScheduleResult};
use crate::fit;

/// The first-fit scheduler.
pub struct Scheduler {
    store: ClusterStore,
    namespace: String,
}

impl Scheduler {
    pub fn new(store: ClusterStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Run the trigger loop until shutdown.
    ///
    /// Pass failures are logged and absorbed; only losing the event
    /// channel ends the loop early.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.events().subscribe();

        // Startup pass catches containers created while we were down.
        if let Err(e) = self.run_pass().await {
            warn!(error = %e, "startup scheduling pass failed");
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ClusterEvent::ContainerAdded(container)) => {
                        debug!(container = %container.id, "scheduling trigger");
                        if let Err(e) = self.run_pass().await {
                            warn!(error = %e, "scheduling pass failed, waiting for next trigger");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Triggers are best-effort; a full pass recovers
                        // whatever the lost events would have scheduled.
                        warn!(missed, "event bus lagged, running catch-up pass");
                        if let Err(e) = self.run_pass().await {
                            warn!(error = %e, "catch-up scheduling pass failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("event bus closed, scheduler stopping");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One full scheduling pass. Returns the number of containers assigned.
    pub async fn run_pass(&self) -> ScheduleResult<u32> {
        let mut nodes = self.store.list_nodes().await?;
        let mut containers = self.store.list_containers(&self.namespace).await?;

        self.repair_assignments(&mut nodes, &containers).await;

        let unscheduled: Vec<String> = containers
            .iter()
            .filter(|c| !c.is_scheduled())
            .map(|c| c.id.clone())
            .collect();

        let mut assigned = 0;
        for id in unscheduled {
            let Some(container) = containers.iter().find(|c| c.id == id) else {
                continue;
            };
            let Some(node_id) = fit::select_node(&nodes, &containers, container).map(|n| n.id.clone())
            else {
                info!(container = %id, "no node with sufficient capacity, leaving unscheduled");
                continue;
            };

            match self.commit_assignment(&mut nodes, &mut containers, &id, &node_id).await {
                Ok(()) => {
                    info!(container = %id, node = %node_id, "container scheduled");
                    assigned += 1;
                }
                Err(e) => {
                    // Transient store failure; the container stays
                    // unscheduled and the next trigger retries it.
                    warn!(container = %id, node = %node_id, error = %e, "failed to persist assignment");
                }
            }
        }

        Ok(assigned)
    }

    /// Persist an assignment: patch the container's `node_id`, then
    /// append it to the node's list. Two writes, not atomic — a crash
    /// in between leaves a dangling assignment that `repair_assignments`
    /// fixes on the next pass.
    async fn commit_assignment(
        &self,
        nodes: &mut [Node],
        containers: &mut [Container],
        container_id: &str,
        node_id: &str,
    ) -> ScheduleResult<()> {
        let container = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| ScheduleError::ContainerNotFound(container_id.to_string()))?;
        container.node_id = node_id.to_string();
        self.store.put_container(container).await?;

        let node = nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| ScheduleError::NodeNotFound(node_id.to_string()))?;
        node.containers.push(container_id.to_string());
        self.store.put_node(node).await?;
        Ok(())
    }

    /// Re-append any container whose `node_id` points at a node that
    /// does not list it (the reverse index is the source of truth for
    /// this repair).
    async fn repair_assignments(&self, nodes: &mut [Node], containers: &[Container]) {
        for container in containers.iter().filter(|c| c.is_scheduled()) {
            let Some(node) = nodes.iter_mut().find(|n| n.id == container.node_id) else {
                warn!(
                    container = %container.id,
                    node = %container.node_id,
                    "container assigned to unknown node"
                );
                continue;
            };
            if node.containers.iter().any(|id| *id == container.id) {
                continue;
            }
            node.containers.push(container.id.clone());
            match self.store.put_node(node).await {
                Ok(()) => {
                    info!(container = %container.id, node = %node.id, "repaired dangling assignment")
                }
                Err(e) => {
                    warn!(container = %container.id, node = %node.id, error = %e, "failed to repair assignment")
                }
            }
        }
    }
}
