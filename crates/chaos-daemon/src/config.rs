//! Daemon configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chaos_core::{ChaosError, Result};
use chaos_namespace::helper::HELPER_NAME;

use crate::runtime::{ContainerRuntime, ProcScanRuntime, StaticRuntime};

/// Default port of the node daemon
pub const DEFAULT_PORT: u16 = 31767;

/// How container identifiers are resolved to PIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeConfig {
    /// Scan `<proc_root>/*/cgroup`
    ProcScan,
    /// YAML map of `runtime://id: pid`
    Static(PathBuf),
}

/// Node daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the RPC server listens on
    pub bind: SocketAddr,
    /// Path to the namespace-entry helper; `None` runs commands in the
    /// daemon's own namespaces
    pub nsexec_path: Option<PathBuf>,
    /// Mount point of the host procfs
    pub proc_root: String,
    /// Deadline for requests that do not carry one
    pub default_timeout: Duration,
    /// Command run in the target's mount+pid namespaces to list processes.
    /// Must print one `PID COMMAND` pair per line.
    pub list_command: Vec<String>,
    pub runtime: RuntimeConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            nsexec_path: Some(PathBuf::from(format!("/usr/local/bin/{}", HELPER_NAME))),
            proc_root: "/proc".to_string(),
            default_timeout: Duration::from_secs(30),
            list_command: vec!["ps".to_string(), "-eo".to_string(), "pid=,comm=".to_string()],
            runtime: RuntimeConfig::ProcScan,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.list_command.is_empty() || self.list_command[0].is_empty() {
            return Err(ChaosError::InvalidConfig(
                "Process list command cannot be empty".to_string(),
            ));
        }

        if self.default_timeout.is_zero() {
            return Err(ChaosError::InvalidConfig(
                "Default timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(helper) = &self.nsexec_path
            && !helper.exists()
        {
            return Err(ChaosError::InvalidConfig(format!(
                "Namespace helper not found at {}",
                helper.display()
            )));
        }

        if !Path::new(&self.proc_root).is_dir() {
            return Err(ChaosError::InvalidConfig(format!(
                "proc root {} is not a directory",
                self.proc_root
            )));
        }

        if let RuntimeConfig::Static(path) = &self.runtime
            && !path.is_file()
        {
            return Err(ChaosError::InvalidConfig(format!(
                "Runtime map {} does not exist",
                path.display()
            )));
        }

        Ok(())
    }

    pub fn build_runtime(&self) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(match &self.runtime {
            RuntimeConfig::ProcScan => Arc::new(ProcScanRuntime::new(&self.proc_root)),
            RuntimeConfig::Static(path) => {
                Arc::new(StaticRuntime::from_file(path)?.with_proc_root(&self.proc_root))
            }
        })
    }
}
