//! FakeRuntime — in-memory runtime with real lifecycle semantics.
//!
//! Implements the full [`RuntimeDriver`] contract: create-then-start
//! ordering, stop-before-remove enforcement, and the lifecycle event
//! stream. Tests can inject per-container create failures to exercise
//! the reconciler's partial-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use corral_store::ContainerStatus;

use crate::driver::{ContainerHandle, CreateSpec, RuntimeDriver, RuntimeEvent};
use crate::error::{RuntimeError, RuntimeResult};

const EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct FakeInner {
    containers: HashMap<String, FakeContainer>,
    subscribers: Vec<mpsc::Sender<RuntimeEvent>>,
    /// IDs whose create calls fail (injected by tests).
    fail_create: HashSet<String>,
    /// Record of (id, timeout_secs) for every stop call.
    stop_calls: Vec<(String, u64)>,
}

struct FakeContainer {
    spec: CreateSpec,
    status: ContainerStatus,
}

/// In-memory implementation of the runtime driver.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls for `id` fail.
    pub fn inject_create_failure(&self, id: &str) {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        inner.fail_create.insert(id.to_string());
    }

    /// Clear an injected create failure.
    pub fn clear_create_failure(&self, id: &str) {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        inner.fail_create.remove(id);
    }

    /// Every `(id, timeout_secs)` stop call seen so far.
    pub fn stop_calls(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock().expect("runtime lock poisoned");
        inner.stop_calls.clone()
    }

    /// The create spec a container was created with, if it exists.
    pub fn spec_of(&self, id: &str) -> Option<CreateSpec> {
        let inner = self.inner.lock().expect("runtime lock poisoned");
        inner.containers.get(id).map(|c| c.spec.clone())
    }

    fn publish(inner: &mut FakeInner, event: RuntimeEvent) {
        inner.subscribers.retain(|tx| !tx.is_closed());
        for tx in &inner.subscribers {
            let _ = tx.try_send(event.clone());
        }
    }
}

#[async_trait]
impl RuntimeDriver for FakeRuntime {
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<ContainerHandle> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        if inner.fail_create.contains(&spec.id) {
            return Err(RuntimeError::Backend(format!(
                "injected create failure for {}",
                spec.id
            )));
        }
        if inner.containers.contains_key(&spec.id) {
            return Err(RuntimeError::InvalidState {
                id: spec.id.clone(),
                expected: "absent".to_string(),
                actual: "present".to_string(),
            });
        }
        inner.containers.insert(
            spec.id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: ContainerStatus::Stopped,
            },
        );
        debug!(id = %spec.id, image = %spec.image, "fake container created");
        Ok(ContainerHandle {
            id: spec.id.clone(),
            status: ContainerStatus::Stopped,
        })
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Running;
        Self::publish(&mut inner, RuntimeEvent::Started { id: id.to_string() });
        Ok(())
    }

    async fn stop(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        inner.stop_calls.push((id.to_string(), timeout_secs));
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let was_running = container.status == ContainerStatus::Running;
        container.status = ContainerStatus::Stopped;
        if was_running {
            Self::publish(
                &mut inner,
                RuntimeEvent::Exited {
                    id: id.to_string(),
                    exit_code: 0,
                },
            );
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        match inner.containers.get(id) {
            None => Err(RuntimeError::NotFound(id.to_string())),
            Some(c) if c.status == ContainerStatus::Running => Err(RuntimeError::InvalidState {
                id: id.to_string(),
                expected: "stopped".to_string(),
                actual: "running".to_string(),
            }),
            Some(_) => {
                inner.containers.remove(id);
                Ok(())
            }
        }
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerHandle>> {
        let inner = self.inner.lock().expect("runtime lock poisoned");
        Ok(inner
            .containers
            .iter()
            .map(|(id, c)| ContainerHandle {
                id: id.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        let inner = self.inner.lock().expect("runtime lock poisoned");
        inner
            .containers
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn subscribe_events(&self) -> mpsc::Receiver<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        inner.subscribers.push(tx);
        rx
    }
}
