//! Target selection and resolution
//!
//! The controller does not talk to an orchestrator. It reads an inventory
//! of pods, their containers and the node daemon addresses, and answers two
//! questions through [`TargetResolver`]: which targets a selector expands
//! to, and where a given target currently lives.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chaos_core::{ChaosError, ContainerId, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::experiment::{RecordId, Selector};

/// A resolved target for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: RecordId,
    pub node: String,
    pub container_id: ContainerId,
}

pub trait TargetResolver: Send + Sync {
    /// Re-read the source of truth; called once at the start of every pass
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Expand a selector into the targets it currently matches, sorted
    fn select(&self, selector: &Selector) -> Result<Vec<RecordId>>;

    /// Where the target lives now; `None` if it no longer exists
    fn resolve(&self, id: &RecordId) -> Result<Option<Target>>;

    /// Daemon address of a node
    fn daemon_address(&self, node: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub name: String,
    /// Runtime-qualified id, e.g. `containerd://4f2a...`
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEntry {
    pub namespace: String,
    pub name: String,
    pub node: String,
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
}

/// Snapshot of the cluster: node daemons and pods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// node name -> daemon address (`host:port` or URL)
    #[serde(default)]
    pub nodes: HashMap<String, String>,
    #[serde(default)]
    pub pods: Vec<PodEntry>,
}

impl Inventory {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ChaosError::InvalidConfig(format!("Invalid inventory: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ChaosError::InvalidConfig(format!("Cannot read inventory {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    fn find(&self, id: &RecordId) -> Option<(&PodEntry, &ContainerEntry)> {
        let pod = self
            .pods
            .iter()
            .find(|p| p.namespace == id.namespace && p.name == id.pod)?;
        let container = pod.containers.iter().find(|c| c.name == id.container)?;
        Some((pod, container))
    }
}

impl TargetResolver for Inventory {
    fn select(&self, selector: &Selector) -> Result<Vec<RecordId>> {
        let mut ids: Vec<RecordId> = self
            .pods
            .iter()
            .flat_map(|pod| {
                pod.containers
                    .iter()
                    .map(move |c| RecordId::new(&pod.namespace, &pod.name, &c.name))
            })
            .filter(|id| selector.matches(id))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn resolve(&self, id: &RecordId) -> Result<Option<Target>> {
        let Some((pod, container)) = self.find(id) else {
            return Ok(None);
        };

        Ok(Some(Target {
            id: id.clone(),
            node: pod.node.clone(),
            container_id: container.id.parse()?,
        }))
    }

    fn daemon_address(&self, node: &str) -> Option<String> {
        self.nodes.get(node).cloned()
    }
}

/// An inventory file that is re-read on every pass
pub struct FileInventory {
    path: PathBuf,
    current: RwLock<Inventory>,
}

impl FileInventory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let current = Inventory::load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    fn snapshot(&self) -> std::sync::RwLockReadGuard<'_, Inventory> {
        self.current
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl TargetResolver for FileInventory {
    fn refresh(&self) -> Result<()> {
        let fresh = Inventory::load(&self.path)?;
        debug!(
            "Reloaded inventory {}: {} nodes, {} pods",
            self.path.display(),
            fresh.nodes.len(),
            fresh.pods.len()
        );
        *self
            .current
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = fresh;
        Ok(())
    }

    fn select(&self, selector: &Selector) -> Result<Vec<RecordId>> {
        self.snapshot().select(selector)
    }

    fn resolve(&self, id: &RecordId) -> Result<Option<Target>> {
        self.snapshot().resolve(id)
    }

    fn daemon_address(&self, node: &str) -> Option<String> {
        self.snapshot().daemon_address(node)
    }
}
