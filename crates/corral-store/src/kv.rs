//! KvStore — the watchable key-value contract and its adapters.
//!
//! The contract is deliberately thin: put, get, ordered prefix list,
//! delete, and a per-key watch stream. `MemoryKv` backs tests and
//! standalone demos; `EtcdKv` adapts the etcd client. Consensus and
//! replication are etcd's problem — this layer only speaks the five
//! operations above.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// A single change observed on a watched key, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvChange {
    Put(Vec<u8>),
    Delete,
}

/// The replicated store contract.
///
/// Unavailability or timeouts surface as errors; retry policy belongs
/// to the caller.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// List all entries under a prefix, in key order.
    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Watch a single key. Each subscriber gets that key's changes in
    /// commit order; cross-key ordering is not guaranteed.
    async fn watch(&self, key: &str) -> StoreResult<mpsc::Receiver<KvChange>>;
}

// ── In-memory adapter ─────────────────────────────────────────────

/// Capacity of each watcher channel. A watcher that falls this far
/// behind starts losing events.
const WATCH_BUFFER: usize = 256;

#[derive(Default)]
struct MemoryInner {
    data: BTreeMap<String, Vec<u8>>,
    watchers: HashMap<String, Vec<mpsc::Sender<KvChange>>>,
}

/// In-memory, watchable key-value store (for tests and standalone mode).
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify watchers of `key` while still holding the lock, so
    /// deliveries preserve commit order. Closed watchers are pruned.
    fn notify(inner: &mut MemoryInner, key: &str, change: &KvChange) {
        let Some(senders) = inner.watchers.get_mut(key) else {
            return;
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            if tx.try_send(change.clone()).is_err() {
                warn!(%key, "watcher buffer full, dropping change event");
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.data.insert(key.to_string(), value.clone());
        Self::notify(&mut inner, key, &KvChange::Put(value));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner.data.get(key).cloned())
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let existed = inner.data.remove(key).is_some();
        if existed {
            Self::notify(&mut inner, key, &KvChange::Delete);
        }
        Ok(existed)
    }

    async fn watch(&self, key: &str) -> StoreResult<mpsc::Receiver<KvChange>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.watchers.entry(key.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

// ── etcd adapter ──────────────────────────────────────────────────

/// etcd-backed store adapter.
///
/// Uses only put / get-with-prefix / delete / watch; no transactions,
/// no leases.
#[derive(Clone)]
pub struct EtcdKv {
    client: etcd_client::Client,
}

impl EtcdKv {
    /// Connect to an etcd cluster.
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let client = etcd_client::Client::connect(endpoints, None)
            .await
            .map_err(map_err!(Connect))?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await.map_err(map_err!(Backend))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(map_err!(Backend))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let options = etcd_client::GetOptions::new().with_prefix();
        let resp = client
            .get(prefix, Some(options))
            .await
            .map_err(map_err!(Backend))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    kv.value().to_vec(),
                )
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await.map_err(map_err!(Backend))?;
        Ok(resp.deleted() > 0)
    }

    async fn watch(&self, key: &str) -> StoreResult<mpsc::Receiver<KvChange>> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(key, None).await.map_err(map_err!(Watch))?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();

        tokio::spawn(async move {
            // Keep the watcher alive for the duration of the stream;
            // dropping it cancels the server-side watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let change = match event.event_type() {
                                etcd_client::EventType::Put => event
                                    .kv()
                                    .map(|kv| KvChange::Put(kv.value().to_vec())),
                                etcd_client::EventType::Delete => Some(KvChange::Delete),
                            };
                            let Some(change) = change else { continue };
                            if tx.send(change).await.is_err() {
                                debug!(%key, "watch subscriber dropped, stopping");
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(%key, "etcd watch stream closed");
                        return;
                    }
                    Err(e) => {
                        warn!(%key, error = %e, "etcd watch stream error");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let kv = MemoryKv::new();

        kv.put("/nodes/a", b"one".to_vec()).await.unwrap();
        assert_eq!(kv.get("/nodes/a").await.unwrap(), Some(b"one".to_vec()));

        assert!(kv.delete("/nodes/a").await.unwrap());
        assert!(!kv.delete("/nodes/a").await.unwrap());
        assert_eq!(kv.get("/nodes/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_is_key_ordered_and_scoped() {
        let kv = MemoryKv::new();
        kv.put("/nodes/b", b"2".to_vec()).await.unwrap();
        kv.put("/nodes/a", b"1".to_vec()).await.unwrap();
        kv.put("/namespaces/default/containers/c1", b"3".to_vec())
            .await
            .unwrap();

        let nodes = kv.list_prefix("/nodes/").await.unwrap();
        let keys: Vec<&str> = nodes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/nodes/a", "/nodes/b"]);
    }

    #[tokio::test]
    async fn watch_delivers_changes_in_commit_order() {
        let kv = MemoryKv::new();
        let mut rx = kv.watch("/nodes/a").await.unwrap();

        kv.put("/nodes/a", b"v1".to_vec()).await.unwrap();
        kv.put("/nodes/a", b"v2".to_vec()).await.unwrap();
        kv.delete("/nodes/a").await.unwrap();

        assert_eq!(rx.recv().await, Some(KvChange::Put(b"v1".to_vec())));
        assert_eq!(rx.recv().await, Some(KvChange::Put(b"v2".to_vec())));
        assert_eq!(rx.recv().await, Some(KvChange::Delete));
    }

    #[tokio::test]
    async fn watch_is_per_key() {
        let kv = MemoryKv::new();
        let mut rx = kv.watch("/nodes/a").await.unwrap();

        kv.put("/nodes/b", b"other".to_vec()).await.unwrap();
        kv.put("/nodes/a", b"mine".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await, Some(KvChange::Put(b"mine".to_vec())));
    }

    #[tokio::test]
    async fn multiple_watchers_each_get_full_stream() {
        let kv = MemoryKv::new();
        let mut rx1 = kv.watch("/nodes/a").await.unwrap();
        let mut rx2 = kv.watch("/nodes/a").await.unwrap();

        kv.put("/nodes/a", b"v".to_vec()).await.unwrap();

        assert_eq!(rx1.recv().await, Some(KvChange::Put(b"v".to_vec())));
        assert_eq!(rx2.recv().await, Some(KvChange::Put(b"v".to_vec())));
    }

    #[tokio::test]
    async fn dropped_watcher_is_pruned() {
        let kv = MemoryKv::new();
        let rx = kv.watch("/nodes/a").await.unwrap();
        drop(rx);

        // Must not error or panic with a closed subscriber around.
        kv.put("/nodes/a", b"v".to_vec()).await.unwrap();
    }
}
