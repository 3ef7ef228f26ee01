//! Reconciler — converges a node's actual state toward the desired set.
//!
//! Each tick fetches this node's desired container set from the store,
//! then runs three independent syncs: storage, network, compute. Order
//! matters within one container (volume and namespace must exist before
//! the runtime create; stop before remove on teardown) but there is no
//! cross-container or cross-sync transaction — every entity's failure
//! is logged and retried on a later tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use corral_runtime::{CreateSpec, RuntimeDriver, RuntimeEvent};
use corral_store::{ClusterStore, Container, ContainerStatus, DesiredStatus};

use crate::error::{AgentError, AgentResult};
use crate::netns::NetworkProvisioner;
use crate::volume::VolumeProvisioner;

/// Stop timeout for containers whose desired record is already gone.
const ORPHAN_STOP_TIMEOUT_SECS: u64 = 10;

/// Node reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub node_id: String,
    pub namespace: String,
    /// Tick interval; a tick always runs to completion before the next
    /// one starts.
    pub interval: Duration,
}

/// The per-node reconciliation loop.
pub struct Reconciler {
    config: ReconcilerConfig,
    store: ClusterStore,
    runtime: Arc<dyn RuntimeDriver>,
    volumes: VolumeProvisioner,
    network: NetworkProvisioner,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: ClusterStore,
        runtime: Arc<dyn RuntimeDriver>,
        volumes: VolumeProvisioner,
        network: NetworkProvisioner,
    ) -> Self {
        Self {
            config,
            store,
            runtime,
            volumes,
            network,
        }
    }

    /// Run the tick loop until shutdown. Ticks never overlap: the
    /// reconcile call is awaited inside the loop body, and missed ticks
    /// are delayed rather than burst.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node = %self.config.node_id, interval = ?self.config.interval, "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(node = %self.config.node_id, error = %e, "reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(node = %self.config.node_id, "reconciler shutting down");
                    return;
                }
            }
        }
    }

    /// One full reconciliation pass: storage, then network, then compute.
    pub async fn reconcile(&self) -> AgentResult<()> {
        let desired = self.desired_containers().await?;
        debug!(node = %self.config.node_id, desired = desired.len(), "reconciling");

        self.sync_storage(&desired).await;
        self.sync_network(&desired).await;
        self.sync_compute(&desired).await;
        Ok(())
    }

    /// Resolve this node's assignment list to container records.
    /// Individually unreadable containers are skipped until next tick.
    async fn desired_containers(&self) -> AgentResult<Vec<Container>> {
        let node = self
            .store
            .get_node(&self.config.node_id)
            .await?
            .ok_or_else(|| AgentError::NodeNotFound(self.config.node_id.clone()))?;

        let mut desired = Vec::with_capacity(node.containers.len());
        for id in &node.containers {
            match self.store.get_container(&self.config.namespace, id).await {
                Ok(Some(container)) => desired.push(container),
                Ok(None) => warn!(%id, "assigned container has no record, skipping"),
                Err(e) => warn!(%id, error = %e, "failed to read container, skipping"),
            }
        }
        Ok(desired)
    }

    // ── Storage sync ──────────────────────────────────────────────

    /// One volume per desired container; create missing, remove extra.
    /// Each volume is independent — one failure never aborts the rest.
    async fn sync_storage(&self, desired: &[Container]) {
        let actual = match self.volumes.list() {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(error = %e, "failed to list volumes, skipping storage sync");
                return;
            }
        };

        for container in desired {
            if actual.iter().any(|v| v.id == container.id) {
                continue;
            }
            if let Err(e) = self.volumes.create(&container.id, container.storage_limit).await {
                warn!(container = %container.id, error = %e, "volume creation failed, will retry next tick");
            }
        }

        for volume in &actual {
            if desired.iter().any(|c| c.id == volume.id) {
                continue;
            }
            match self.volumes.remove(&volume.id).await {
                Ok(report) if !report.is_clean() => {
                    warn!(volume = %volume.id, %report, "volume teardown incomplete")
                }
                Ok(_) => {}
                Err(e) => warn!(volume = %volume.id, error = %e, "volume removal failed"),
            }
        }
    }

    // ── Network sync ──────────────────────────────────────────────

    /// One namespace per desired container; create + CNI attach for
    /// missing, full teardown for extra.
    async fn sync_network(&self, desired: &[Container]) {
        let actual = match self.network.list() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list namespaces, skipping network sync");
                return;
            }
        };

        for container in desired {
            if actual.iter().any(|name| *name == container.id) {
                continue;
            }
            if let Err(e) = self.network.setup(&container.id, &container.ports).await {
                warn!(container = %container.id, error = %e, "network setup failed, will retry next tick");
            }
        }

        for name in &actual {
            if desired.iter().any(|c| c.id == *name) {
                continue;
            }
            match self.network.cleanup(name).await {
                Ok(report) if !report.is_clean() => {
                    warn!(namespace = %name, %report, "network teardown incomplete")
                }
                Ok(_) => {}
                Err(e) => warn!(namespace = %name, error = %e, "network cleanup failed"),
            }
        }
    }

    // ── Compute sync ──────────────────────────────────────────────

    /// Create missing containers (storage and network already exist
    /// from the earlier syncs), converge status for present ones, and
    /// tear down containers that are no longer desired.
    async fn sync_compute(&self, desired: &[Container]) {
        let actual = match self.runtime.list().await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(error = %e, "failed to list runtime containers, skipping compute sync");
                return;
            }
        };
        let observed: HashMap<&str, ContainerStatus> =
            actual.iter().map(|h| (h.id.as_str(), h.status)).collect();

        for container in desired {
            let result = match observed.get(container.id.as_str()) {
                None => self.create_and_converge(container).await,
                Some(&status) => self.converge_status(container, status).await,
            };
            if let Err(e) = result {
                warn!(container = %container.id, error = %e, "compute sync failed, will retry next tick");
            }
        }

        for handle in &actual {
            if desired.iter().any(|c| c.id == handle.id) {
                continue;
            }
            if let Err(e) = self.teardown_container(&handle.id, handle.status).await {
                warn!(container = %handle.id, error = %e, "container teardown failed, will retry next tick");
            }
        }
    }

    async fn create_and_converge(&self, container: &Container) -> AgentResult<()> {
        let spec = CreateSpec {
            id: container.id.clone(),
            image: container.image.clone(),
            env: container.env.clone(),
            cpu_limit: container.cpu_limit,
            memory_limit: container.memory_limit,
            volume_mount: self.volumes.mount_point(&container.id),
            netns_path: self.network.netns_path(&container.id),
        };
        let handle = self.runtime.create(&spec).await?;
        info!(container = %container.id, image = %container.image, "container created");
        self.converge_status(container, handle.status).await
    }

    /// Drive observed toward desired. Stopping is never escalated to
    /// removal here — only containers absent from the desired set are
    /// removed.
    async fn converge_status(
        &self,
        container: &Container,
        observed: ContainerStatus,
    ) -> AgentResult<()> {
        match container.desired_status {
            DesiredStatus::Running if observed != ContainerStatus::Running => {
                debug!(container = %container.id, %observed, "starting container");
                self.runtime.start(&container.id).await?;
            }
            DesiredStatus::Stopped if observed != ContainerStatus::Stopped => {
                debug!(container = %container.id, %observed, timeout = container.stop_timeout_secs, "stopping container");
                self.runtime
                    .stop(&container.id, container.stop_timeout_secs)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop, remove, then release the container's storage and network —
    /// the same removal paths the storage/network syncs use.
    async fn teardown_container(&self, id: &str, observed: ContainerStatus) -> AgentResult<()> {
        if observed != ContainerStatus::Stopped {
            self.runtime.stop(id, ORPHAN_STOP_TIMEOUT_SECS).await?;
        }
        self.runtime.remove(id).await?;
        info!(container = %id, "undesired container removed");
        self.release_resources(id).await;
        Ok(())
    }

    /// Best-effort release of a single container's volume and network.
    /// Already-absent resources are fine — the earlier syncs may have
    /// reclaimed them in the same tick.
    async fn release_resources(&self, id: &str) {
        match self.volumes.remove(id).await {
            Ok(report) if !report.is_clean() => warn!(%id, %report, "volume teardown incomplete"),
            Ok(_) | Err(AgentError::VolumeNotFound(_)) => {}
            Err(e) => warn!(%id, error = %e, "volume removal failed"),
        }
        match self.network.cleanup(id).await {
            Ok(report) if !report.is_clean() => warn!(%id, %report, "network teardown incomplete"),
            Ok(_) | Err(AgentError::NamespaceNotFound(_)) => {}
            Err(e) => warn!(%id, error = %e, "network cleanup failed"),
        }
    }
}

/// Listen to the runtime's lifecycle event stream and write observed
/// status back into the store. This is the only writer of `status`.
pub async fn run_runtime_event_listener(
    store: ClusterStore,
    namespace: String,
    runtime: Arc<dyn RuntimeDriver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = runtime.subscribe_events().await;
    info!("runtime event listener started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let status = match &event {
                        RuntimeEvent::Started { .. } => ContainerStatus::Running,
                        RuntimeEvent::Exited { id, exit_code } => {
                            debug!(%id, exit_code, "container exited");
                            ContainerStatus::Stopped
                        }
                    };
                    let id = event.container_id();
                    if let Err(e) = store.update_container_status(&namespace, id, status).await {
                        warn!(%id, error = %e, "failed to record observed status");
                    }
                }
                None => {
                    info!("runtime event stream closed, listener stopping");
                    return;
                }
            },
            _ = shutdown.changed() => {
                info!("runtime event listener shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedExec;
    use crate::netns::NetworkConfig;
    use corral_runtime::FakeRuntime;
    use corral_store::*;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    struct Fixture {
        store: ClusterStore,
        runtime: Arc<FakeRuntime>,
        reconciler: Reconciler,
        storage_root: TempDir,
        _netns_dir: TempDir,
        exec: Arc<ScriptedExec>,
    }

    fn fixture() -> Fixture {
        let store = ClusterStore::new(Arc::new(MemoryKv::new()), EventBus::new());
        let runtime = Arc::new(FakeRuntime::new());
        let exec = Arc::new(ScriptedExec::new());
        let storage_root = TempDir::new().unwrap();
        let netns_dir = TempDir::new().unwrap();

        let volumes = VolumeProvisioner::new(storage_root.path(), exec.clone() as Arc<dyn crate::Exec>);
        let network = NetworkProvisioner::new(
            NetworkConfig {
                netns_dir: netns_dir.path().to_path_buf(),
                ..NetworkConfig::default()
            },
            exec.clone() as Arc<dyn crate::Exec>,
        );

        let reconciler = Reconciler::new(
            ReconcilerConfig {
                node_id: "node-1".to_string(),
                namespace: "default".to_string(),
                interval: Duration::from_secs(5),
            },
            store.clone(),
            runtime.clone() as Arc<dyn RuntimeDriver>,
            volumes,
            network,
        );

        Fixture {
            store,
            runtime,
            reconciler,
            storage_root,
            _netns_dir: netns_dir,
            exec,
        }
    }

    fn container(id: &str) -> Container {
        Container {
            id: id.to_string(),
            namespace: "default".to_string(),
            image: "nginx:latest".to_string(),
            env: StdHashMap::new(),
            ports: vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: Protocol::Tcp,
            }],
            cpu_limit: 1,
            memory_limit: 1,
            storage_limit: 5,
            stop_timeout_secs: 7,
            node_id: "node-1".to_string(),
            desired_status: DesiredStatus::Running,
            status: ContainerStatus::Unknown,
        }
    }

    async fn assign(fx: &Fixture, containers: &[Container]) {
        let node = Node {
            id: "node-1".to_string(),
            ip: "10.0.0.1".to_string(),
            cpu_limit: 8,
            memory_limit: 16,
            storage_limit: 200,
            containers: containers.iter().map(|c| c.id.clone()).collect(),
        };
        fx.store.put_node(&node).await.unwrap();
        for c in containers {
            fx.store.put_container(c).await.unwrap();
        }
    }

    #[tokio::test]
    async fn converges_desired_set_in_one_pass() {
        let fx = fixture();
        let mut c2 = container("c2");
        c2.ports[0].host_port = 9090;
        assign(&fx, &[container("c1"), c2]).await;

        fx.reconciler.reconcile().await.unwrap();

        // Volumes exist for both containers.
        assert!(fx.storage_root.path().join("c1").is_dir());
        assert!(fx.storage_root.path().join("c2").is_dir());

        // Namespaces were set up with CNI.
        assert!(fx.exec.ran("ip netns add c1"));
        assert!(fx.exec.ran("ip netns add c2"));

        // Both containers are running.
        assert_eq!(
            fx.runtime.inspect("c1").await.unwrap(),
            ContainerStatus::Running
        );
        assert_eq!(
            fx.runtime.inspect("c2").await.unwrap(),
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn create_binds_provisioned_paths() {
        let fx = fixture();
        assign(&fx, &[container("c1")]).await;

        fx.reconciler.reconcile().await.unwrap();

        let spec = fx.runtime.spec_of("c1").unwrap();
        assert_eq!(spec.volume_mount, fx.storage_root.path().join("c1"));
        assert!(spec.netns_path.ends_with("c1"));
    }

    #[tokio::test]
    async fn desired_stopped_stops_without_removing() {
        let fx = fixture();
        let mut c1 = container("c1");
        c1.desired_status = DesiredStatus::Stopped;
        assign(&fx, &[c1]).await;

        // Container already exists and runs.
        fx.runtime
            .create(&CreateSpec {
                id: "c1".to_string(),
                image: "nginx:latest".to_string(),
                env: StdHashMap::new(),
                cpu_limit: 1,
                memory_limit: 1,
                volume_mount: fx.storage_root.path().join("c1"),
                netns_path: std::path::PathBuf::from("/var/run/netns/c1"),
            })
            .await
            .unwrap();
        fx.runtime.start("c1").await.unwrap();

        fx.reconciler.reconcile().await.unwrap();

        // Graceful stop with the container's configured timeout; no removal.
        assert_eq!(fx.runtime.stop_calls(), vec![("c1".to_string(), 7)]);
        assert_eq!(
            fx.runtime.inspect("c1").await.unwrap(),
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn undesired_container_is_stopped_removed_and_released() {
        let fx = fixture();
        assign(&fx, &[]).await;

        fx.runtime
            .create(&CreateSpec {
                id: "c-old".to_string(),
                image: "nginx:latest".to_string(),
                env: StdHashMap::new(),
                cpu_limit: 1,
                memory_limit: 1,
                volume_mount: fx.storage_root.path().join("c-old"),
                netns_path: std::path::PathBuf::from("/var/run/netns/c-old"),
            })
            .await
            .unwrap();
        fx.runtime.start("c-old").await.unwrap();
        std::fs::create_dir_all(fx.storage_root.path().join("c-old")).unwrap();

        fx.reconciler.reconcile().await.unwrap();

        assert!(matches!(
            fx.runtime.inspect("c-old").await,
            Err(corral_runtime::RuntimeError::NotFound(_))
        ));
        // Stop preceded removal.
        assert_eq!(fx.runtime.stop_calls()[0].0, "c-old");
        // Volume reclaimed (by the storage sync or the release path).
        assert!(!fx.storage_root.path().join("c-old").exists());
    }

    #[tokio::test]
    async fn one_failing_create_does_not_block_others() {
        let fx = fixture();
        let mut c2 = container("c2");
        c2.ports[0].host_port = 9090;
        assign(&fx, &[container("c1"), c2]).await;
        fx.runtime.inject_create_failure("c1");

        fx.reconciler.reconcile().await.unwrap();

        assert!(fx.runtime.inspect("c1").await.is_err());
        assert_eq!(
            fx.runtime.inspect("c2").await.unwrap(),
            ContainerStatus::Running
        );

        // Once the dependency is fixed, the next tick converges c1 too.
        fx.runtime.clear_create_failure("c1");
        fx.reconciler.reconcile().await.unwrap();
        assert_eq!(
            fx.runtime.inspect("c1").await.unwrap(),
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let fx = fixture();
        assign(&fx, &[container("c1")]).await;

        fx.reconciler.reconcile().await.unwrap();
        fx.reconciler.reconcile().await.unwrap();

        // No second create or start happened.
        assert_eq!(
            fx.runtime.inspect("c1").await.unwrap(),
            ContainerStatus::Running
        );
        let netns_adds = fx
            .exec
            .invocations()
            .iter()
            .filter(|line| line.contains("netns add c1"))
            .count();
        // The scripted exec never materializes namespace files, so the
        // network sync retries the add; the volume side must not.
        assert!(netns_adds >= 1);
        let fallocates = fx
            .exec
            .invocations()
            .iter()
            .filter(|line| line.contains("fallocate"))
            .count();
        assert_eq!(fallocates, 1);
    }

    #[tokio::test]
    async fn missing_node_record_is_an_error() {
        let fx = fixture();
        let result = fx.reconciler.reconcile().await;
        assert!(matches!(result, Err(AgentError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn event_listener_records_observed_status() {
        let fx = fixture();
        fx.store.put_container(&container("c1")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(run_runtime_event_listener(
            fx.store.clone(),
            "default".to_string(),
            fx.runtime.clone() as Arc<dyn RuntimeDriver>,
            shutdown_rx,
        ));
        // Let the listener subscribe before emitting events.
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.runtime
            .create(&CreateSpec {
                id: "c1".to_string(),
                image: "nginx:latest".to_string(),
                env: StdHashMap::new(),
                cpu_limit: 1,
                memory_limit: 1,
                volume_mount: fx.storage_root.path().join("c1"),
                netns_path: std::path::PathBuf::from("/var/run/netns/c1"),
            })
            .await
            .unwrap();
        fx.runtime.start("c1").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let c = fx.store.get_container("default", "c1").await.unwrap().unwrap();
            if c.status == ContainerStatus::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "status never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        fx.runtime.stop("c1", 5).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let c = fx.store.get_container("default", "c1").await.unwrap().unwrap();
            if c.status == ContainerStatus::Stopped {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "stop never observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }
}
