//! In-process fakes for controller tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chaos_controller::experiment::{ExperimentSpec, FaultSpec, Selector};
use chaos_controller::inventory::{ContainerEntry, PodEntry};
use chaos_controller::{DaemonConnector, Experiment, FaultDaemon, Inventory};
use chaos_core::{ChaosError, Result};
use chaos_daemon::proto::{
    ExecFaultRequest, HealthResponse, ListProcessesRequest, ListProcessesResponse, ProcessEntry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub container_id: String,
    pub command: Vec<String>,
}

/// A node daemon that records every call
#[derive(Default)]
pub struct FakeDaemon {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, VecDeque<ChaosError>>>,
    delay: Mutex<Duration>,
    active: Mutex<HashMap<String, usize>>,
    max_active: AtomicUsize,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let daemon = Self::default();
        *daemon.delay.lock().unwrap() = delay;
        Arc::new(daemon)
    }

    /// Fail the next call on `container_id` with `err`
    pub fn fail_next(&self, container_id: &str, err: ChaosError) {
        self.failures
            .lock()
            .unwrap()
            .entry(container_id.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of concurrent calls seen on a single container
    pub fn max_active_per_container(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn handle(&self, container_id: &str, command: Vec<String>) -> Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(container_id.to_string()).or_default();
            *count += 1;
            self.max_active.fetch_max(*count, Ordering::SeqCst);
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().unwrap().push(Call {
            container_id: container_id.to_string(),
            command,
        });
        *self
            .active
            .lock()
            .unwrap()
            .get_mut(container_id)
            .unwrap() -= 1;

        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(container_id)
            .and_then(|q| q.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FaultDaemon for FakeDaemon {
    async fn exec(&self, req: ExecFaultRequest) -> Result<()> {
        self.handle(&req.container_id, req.command).await
    }

    async fn list_processes(&self, req: ListProcessesRequest) -> Result<ListProcessesResponse> {
        self.handle(&req.container_id, vec!["ps".to_string()]).await?;
        Ok(ListProcessesResponse {
            processes: vec![ProcessEntry {
                pid: 1,
                command: "pause".to_string(),
            }],
        })
    }

    async fn health(&self) -> Result<HealthResponse> {
        Ok(HealthResponse {
            status: "ok".to_string(),
            version: "test".to_string(),
            in_flight: 0,
        })
    }
}

/// Hands out one fake daemon per node
#[derive(Default)]
pub struct FakeConnector {
    daemons: HashMap<String, Arc<FakeDaemon>>,
}

impl FakeConnector {
    pub fn with(mut self, node: &str, daemon: Arc<FakeDaemon>) -> Self {
        self.daemons.insert(node.to_string(), daemon);
        self
    }
}

impl DaemonConnector for FakeConnector {
    fn connect(&self, node: &str, _address: &str) -> Result<Arc<dyn FaultDaemon>> {
        match self.daemons.get(node) {
            Some(daemon) => Ok(daemon.clone()),
            None => Err(ChaosError::Connection(format!("no daemon on {}", node))),
        }
    }
}

/// Pod `name` in namespace `web` with one container `app` whose id is
/// `containerd://<name>`
pub fn pod(name: &str, node: &str) -> PodEntry {
    PodEntry {
        namespace: "web".to_string(),
        name: name.to_string(),
        node: node.to_string(),
        containers: vec![ContainerEntry {
            name: "app".to_string(),
            id: container_id(name),
        }],
    }
}

pub fn container_id(pod: &str) -> String {
    format!("containerd://{}", pod)
}

pub fn inventory(pods: Vec<PodEntry>) -> Inventory {
    let mut inventory = Inventory::default();
    for pod in &pods {
        inventory
            .nodes
            .insert(pod.node.clone(), format!("{}:31767", pod.node));
    }
    inventory.pods = pods;
    inventory
}

pub fn write_inventory(path: &Path, inventory: &Inventory) {
    std::fs::write(path, serde_yaml::to_string(inventory).unwrap()).unwrap();
}

pub fn experiment(kind: &str, params: serde_json::Value) -> Experiment {
    Experiment {
        name: "test".to_string(),
        spec: ExperimentSpec {
            fault: FaultSpec {
                kind: kind.to_string(),
                params,
            },
            selector: Selector {
                namespace: "web".to_string(),
                pods: Vec::new(),
                container: None,
            },
            duration: None,
            desired: Default::default(),
        },
        status: Default::default(),
    }
}

pub fn exec_params() -> serde_json::Value {
    serde_json::json!({
        "apply": ["tc", "qdisc", "add"],
        "recover": ["tc", "qdisc", "del"],
    })
}

pub fn inventory_path(dir: &Path) -> PathBuf {
    dir.join("inventory.yaml")
}
