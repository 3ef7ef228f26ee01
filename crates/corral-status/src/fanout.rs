//! StatusFanout — one store watch per subscribed container, many readers.
//!
//! The first subscriber for a container ID starts a background task
//! watching that container's store key; the last unsubscribe stops it.
//! The registry is a single mutex held only for map mutation. Delivery
//! uses bounded `try_send`: a subscriber that stops draining loses
//! messages (with a warning) instead of stalling the other subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use corral_store::{ClusterStore, KvChange};

use crate::error::StatusResult;

/// Per-subscriber channel capacity.
const SUBSCRIBER_BUFFER: usize = 16;

struct Entry {
    subscribers: Vec<(u64, mpsc::Sender<Vec<u8>>)>,
    stop: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    next_token: u64,
}

/// A live subscription to one container's status stream.
///
/// Dropping the subscription without calling
/// [`StatusFanout::unsubscribe`] leaves a dead sender in the registry;
/// it is pruned on the next delivery for that container.
pub struct Subscription {
    container_id: String,
    token: u64,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Receive the next raw serialized container record. Returns `None`
    /// once the stream is closed (container deleted or watch stopped).
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

/// Multiplexes store watches to per-container subscriber sets.
#[derive(Clone)]
pub struct StatusFanout {
    store: ClusterStore,
    namespace: String,
    registry: Arc<Mutex<Registry>>,
}

impl StatusFanout {
    pub fn new(store: ClusterStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Subscribe to a container's status stream. The first subscriber
    /// for an ID starts the backing store watch.
    pub async fn subscribe(&self, container_id: &str) -> StatusResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            let token = registry.next_token;
            if let Some(entry) = registry.entries.get_mut(container_id) {
                entry.subscribers.push((token, tx));
                registry.next_token += 1;
                debug!(%container_id, token, "subscriber joined existing watch");
                return Ok(Subscription {
                    container_id: container_id.to_string(),
                    token,
                    receiver: rx,
                });
            }
        }

        // No watch yet for this ID. Start one outside the lock, then
        // re-check: a concurrent subscribe may have won the race.
        let changes = self.store.watch_container(&self.namespace, container_id).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let token;
        let spawn_watch;
        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            token = registry.next_token;
            registry.next_token += 1;
            match registry.entries.get_mut(container_id) {
                Some(entry) => {
                    entry.subscribers.push((token, tx));
                    spawn_watch = false;
                }
                None => {
                    registry.entries.insert(
                        container_id.to_string(),
                        Entry {
                            subscribers: vec![(token, tx)],
                            stop: stop_tx,
                        },
                    );
                    spawn_watch = true;
                }
            }
        }

        if spawn_watch {
            info!(%container_id, "starting status watch");
            let fanout = self.clone();
            let id = container_id.to_string();
            tokio::spawn(async move {
                fanout.run_watch(id, changes, stop_rx).await;
            });
        }

        Ok(Subscription {
            container_id: container_id.to_string(),
            token,
            receiver: rx,
        })
    }

    /// Unsubscribe. Stops the backing watch when this was the last
    /// subscriber for the container.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let Some(entry) = registry.entries.get_mut(&subscription.container_id) else {
            return;
        };
        entry.subscribers.retain(|(token, _)| *token != subscription.token);
        if entry.subscribers.is_empty()
            && let Some(entry) = registry.entries.remove(&subscription.container_id)
        {
            let _ = entry.stop.send(true);
            info!(container_id = %subscription.container_id, "last subscriber left, stopping watch");
        }
    }

    /// Number of live subscribers for a container.
    pub fn subscriber_count(&self, container_id: &str) -> usize {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry
            .entries
            .get(container_id)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of containers with an active watch task.
    pub fn active_watches(&self) -> usize {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.entries.len()
    }

    /// Watch task body: forward each committed value to every current
    /// subscriber, prune dead ones, and tear the entry down on key
    /// deletion, stream closure, or an explicit stop.
    async fn run_watch(
        &self,
        container_id: String,
        mut changes: mpsc::Receiver<KvChange>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Some(KvChange::Put(value)) => self.publish(&container_id, value),
                    Some(KvChange::Delete) => {
                        debug!(%container_id, "container deleted, closing status stream");
                        self.remove_entry(&container_id);
                        return;
                    }
                    None => {
                        debug!(%container_id, "store watch closed, closing status stream");
                        self.remove_entry(&container_id);
                        return;
                    }
                },
                _ = stop.changed() => {
                    debug!(%container_id, "status watch stopped");
                    return;
                }
            }
        }
    }

    /// Deliver one value to every subscriber of a container. `try_send`
    /// keeps a full or abandoned subscriber from delaying the others;
    /// closed subscribers are pruned, and the watch stops when none
    /// remain.
    fn publish(&self, container_id: &str, value: Vec<u8>) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let Some(entry) = registry.entries.get_mut(container_id) else {
            return;
        };

        entry.subscribers.retain(|(token, tx)| {
            match tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%container_id, token, "subscriber buffer full, dropping status update");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%container_id, token, "subscriber gone, pruning");
                    false
                }
            }
        });

        if entry.subscribers.is_empty()
            && let Some(entry) = registry.entries.remove(container_id)
        {
            let _ = entry.stop.send(true);
            info!(%container_id, "all subscribers gone, stopping watch");
        }
    }

    /// Drop a container's entry, closing every subscriber channel.
    fn remove_entry(&self, container_id: &str) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.entries.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_store::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_store() -> ClusterStore {
        ClusterStore::new(Arc::new(MemoryKv::new()), EventBus::new())
    }

    fn test_container(id: &str) -> Container {
        Container {
            id: id.to_string(),
            namespace: "default".to_string(),
            image: "nginx:latest".to_string(),
            env: HashMap::new(),
            ports: Vec::new(),
            cpu_limit: 1,
            memory_limit: 1,
            storage_limit: 5,
            stop_timeout_secs: 10,
            node_id: String::new(),
            desired_status: DesiredStatus::Running,
            status: ContainerStatus::Unknown,
        }
    }

    async fn recv_container(sub: &mut Subscription) -> Container {
        let bytes = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for status update")
            .expect("stream closed unexpectedly");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn subscriber_sees_status_changes() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        let mut sub = fanout.subscribe("c1").await.unwrap();
        store
            .update_container_status("default", "c1", ContainerStatus::Running)
            .await
            .unwrap();

        let seen = recv_container(&mut sub).await;
        assert_eq!(seen.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_update() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        let mut a = fanout.subscribe("c1").await.unwrap();
        let mut b = fanout.subscribe("c1").await.unwrap();
        assert_eq!(fanout.subscriber_count("c1"), 2);
        assert_eq!(fanout.active_watches(), 1);

        store
            .update_container_status("default", "c1", ContainerStatus::Running)
            .await
            .unwrap();

        assert_eq!(recv_container(&mut a).await.status, ContainerStatus::Running);
        assert_eq!(recv_container(&mut b).await.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_the_watch() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        let a = fanout.subscribe("c1").await.unwrap();
        let b = fanout.subscribe("c1").await.unwrap();

        fanout.unsubscribe(a);
        assert_eq!(fanout.subscriber_count("c1"), 1);
        assert_eq!(fanout.active_watches(), 1);

        fanout.unsubscribe(b);
        assert_eq!(fanout.subscriber_count("c1"), 0);
        assert_eq!(fanout.active_watches(), 0);
    }

    #[tokio::test]
    async fn container_deletion_closes_the_stream() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        let mut sub = fanout.subscribe("c1").await.unwrap();
        store.delete_container("default", "c1").await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while sub.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "stream never closed after deletion");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_updates_but_blocks_nobody() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        // Never drained; its buffer fills and overflow is dropped.
        let mut slow = fanout.subscribe("c1").await.unwrap();

        for i in 0..(SUBSCRIBER_BUFFER * 2) {
            let status = if i % 2 == 0 {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            };
            store
                .update_container_status("default", "c1", status)
                .await
                .unwrap();
        }
        // Let the watch task flush the store's change stream.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A late subscriber still gets fresh updates.
        let mut fresh = fanout.subscribe("c1").await.unwrap();
        store
            .update_container_status("default", "c1", ContainerStatus::Running)
            .await
            .unwrap();
        assert_eq!(
            recv_container(&mut fresh).await.status,
            ContainerStatus::Running
        );

        // The slow subscriber drains at most its buffer without hanging.
        let mut drained = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(100), slow.recv()).await
        {
            drained += 1;
            if drained > SUBSCRIBER_BUFFER + 1 {
                break;
            }
        }
        assert!(drained <= SUBSCRIBER_BUFFER + 1, "buffer bound not enforced");
        assert!(drained > 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_next_delivery() {
        let store = test_store();
        store.put_container(&test_container("c1")).await.unwrap();
        let fanout = StatusFanout::new(store.clone(), "default");

        let sub = fanout.subscribe("c1").await.unwrap();
        drop(sub);
        assert_eq!(fanout.subscriber_count("c1"), 1);

        store
            .update_container_status("default", "c1", ContainerStatus::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pruned on publish; with no one left the watch stops too.
        assert_eq!(fanout.subscriber_count("c1"), 0);
        assert_eq!(fanout.active_watches(), 0);
    }
}
