//! Container ID → PID resolution
//!
//! The daemon only needs one question answered by the container runtime:
//! which host PID shares the isolation context of a container.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chaos_core::util::pid_exists;
use chaos_core::{ChaosError, ContainerId, Result};
use log::debug;

/// Resolves a container identifier to a process in its namespaces
pub trait ContainerRuntime: Send + Sync {
    /// PID of a process sharing the container's namespaces
    fn pid_of(&self, container: &ContainerId) -> Result<u32>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Finds the container's lowest PID by scanning `<proc>/<pid>/cgroup`.
///
/// containerd, docker and cri-o all place the container hash in the cgroup
/// path of every process of the container, so this works without a
/// runtime socket.
pub struct ProcScanRuntime {
    proc_root: PathBuf,
}

impl ProcScanRuntime {
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcScanRuntime {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ContainerRuntime for ProcScanRuntime {
    fn pid_of(&self, container: &ContainerId) -> Result<u32> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| {
            ChaosError::Io(std::io::Error::other(format!(
                "Failed to read {}: {}",
                self.proc_root.display(),
                e
            )))
        })?;

        let mut found: Option<u32> = None;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            // Processes exit while we scan; unreadable entries are skipped
            let Ok(cgroup) = fs::read_to_string(entry.path().join("cgroup")) else {
                continue;
            };

            if cgroup_names_container(&cgroup, container.id()) {
                found = Some(found.map_or(pid, |current| current.min(pid)));
            }
        }

        let pid = found.ok_or_else(|| ChaosError::ContainerNotFound(container.to_string()))?;
        debug!("Resolved {} to pid {} via {}", container, pid, self.name());
        Ok(pid)
    }

    fn name(&self) -> &'static str {
        "proc-scan"
    }
}

/// True if the leaf cgroup of one of the paths names exactly `id`.
///
/// Accepted leaf forms are `<id>` (cgroupfs driver) and `<prefix>-<id>`
/// with an optional `.scope` suffix (systemd driver: `docker-<id>.scope`,
/// `cri-containerd-<id>.scope`, `crio-<id>.scope`).
fn cgroup_names_container(cgroup: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }

    cgroup
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .filter_map(|path| path.trim_end_matches('/').rsplit('/').next())
        .map(|segment| segment.strip_suffix(".scope").unwrap_or(segment))
        .any(|segment| {
            segment == id
                || segment
                    .strip_suffix(id)
                    .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('-'))
        })
}

/// Fixed container → PID table, loaded from a YAML map
pub struct StaticRuntime {
    pids: HashMap<String, u32>,
    proc_root: String,
}

impl StaticRuntime {
    pub fn new(pids: HashMap<String, u32>) -> Self {
        Self {
            pids,
            proc_root: "/proc".to_string(),
        }
    }

    /// Check PID liveness under `proc_root` instead of `/proc`
    pub fn with_proc_root(mut self, proc_root: &str) -> Self {
        self.proc_root = proc_root.to_string();
        self
    }

    /// Load a YAML map of `runtime://id: pid`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let pids: HashMap<String, u32> = serde_yaml::from_str(&content).map_err(|e| {
            ChaosError::InvalidConfig(format!("Invalid runtime map {}: {}", path.display(), e))
        })?;
        Ok(Self::new(pids))
    }
}

impl ContainerRuntime for StaticRuntime {
    fn pid_of(&self, container: &ContainerId) -> Result<u32> {
        match self.pids.get(&container.to_string()) {
            Some(&pid) if pid_exists(&self.proc_root, pid) => Ok(pid),
            Some(&pid) => Err(ChaosError::ContainerNotFound(format!(
                "{} (pid {} exited)",
                container, pid
            ))),
            None => Err(ChaosError::ContainerNotFound(container.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
