//! In-process cluster event bus.
//!
//! Creates and deletions of stored entities emit a [`ClusterEvent`] so
//! control-plane loops (the scheduler, mainly) can react without
//! polling. Delivery is best-effort and at-most-once: events are not
//! durable, and a restarted process must re-list instead of replaying.
//! Subscribers that lag past the channel capacity lose events.

use tokio::sync::broadcast;

use crate::types::{Container, ContainerId, Node, NodeId};

/// Default buffer size for the broadcast channel.
const EVENT_BUFFER: usize = 128;

/// A mutation of a stored entity.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    ContainerAdded(Box<Container>),
    ContainerRemoved(ContainerId),
    NodeAdded(Box<Node>),
    NodeRemoved(NodeId),
}

/// Owned event registry, injected into whatever needs to emit or
/// listen. There is deliberately no package-level bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Subscribe to all cluster events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
