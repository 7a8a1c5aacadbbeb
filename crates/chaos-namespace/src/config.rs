//! Namespace kinds and target namespace sets

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chaos_core::{ChaosError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Namespace kinds that a fault can be executed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Mnt,
    Net,
    Pid,
    Uts,
    Ipc,
}

impl NamespaceType {
    /// Order in which the helper enters namespaces. Mount goes last so the
    /// other namespace files are opened and joined from the host view.
    pub const ENTRY_ORDER: [NamespaceType; 5] = [
        NamespaceType::Ipc,
        NamespaceType::Uts,
        NamespaceType::Net,
        NamespaceType::Pid,
        NamespaceType::Mnt,
    ];

    /// File name under /proc/<pid>/ns/
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceType::Mnt => "mnt",
            NamespaceType::Net => "net",
            NamespaceType::Pid => "pid",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
        }
    }

    /// Flag passed to setns(2)
    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceType::Mnt => CloneFlags::CLONE_NEWNS,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        }
    }

    /// Short option used on the helper command line
    pub fn helper_flag(&self) -> &'static str {
        match self {
            NamespaceType::Mnt => "-m",
            NamespaceType::Net => "-n",
            NamespaceType::Pid => "-p",
            NamespaceType::Uts => "-u",
            NamespaceType::Ipc => "-i",
        }
    }

    /// Path of this namespace for a process, under `proc_root` (normally `/proc`)
    pub fn path_for(&self, proc_root: &str, pid: u32) -> PathBuf {
        PathBuf::from(format!("{}/{}/ns/{}", proc_root, pid, self.proc_name()))
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceType {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mnt" | "mount" => Ok(NamespaceType::Mnt),
            "net" | "network" => Ok(NamespaceType::Net),
            "pid" => Ok(NamespaceType::Pid),
            "uts" => Ok(NamespaceType::Uts),
            "ipc" => Ok(NamespaceType::Ipc),
            _ => Err(ChaosError::InvalidConfig(format!(
                "Unknown namespace type: {}",
                s
            ))),
        }
    }
}

/// Set of namespaces to enter for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamespaceSet {
    pub mnt: bool,
    pub net: bool,
    pub pid: bool,
    pub uts: bool,
    pub ipc: bool,
}

impl NamespaceSet {
    /// No namespace entry; run in the caller's namespaces
    pub fn none() -> Self {
        Self::default()
    }

    /// All supported namespaces
    pub fn all() -> Self {
        Self {
            mnt: true,
            net: true,
            pid: true,
            uts: true,
            ipc: true,
        }
    }

    /// Mount + PID: the view a process listing needs
    pub fn process_view() -> Self {
        Self {
            mnt: true,
            pid: true,
            ..Self::none()
        }
    }

    pub fn from_types(types: &[NamespaceType]) -> Self {
        let mut set = Self::none();
        for ns in types {
            set.insert(*ns);
        }
        set
    }

    pub fn insert(&mut self, ns: NamespaceType) {
        match ns {
            NamespaceType::Mnt => self.mnt = true,
            NamespaceType::Net => self.net = true,
            NamespaceType::Pid => self.pid = true,
            NamespaceType::Uts => self.uts = true,
            NamespaceType::Ipc => self.ipc = true,
        }
    }

    pub fn contains(&self, ns: NamespaceType) -> bool {
        match ns {
            NamespaceType::Mnt => self.mnt,
            NamespaceType::Net => self.net,
            NamespaceType::Pid => self.pid,
            NamespaceType::Uts => self.uts,
            NamespaceType::Ipc => self.ipc,
        }
    }

    /// Enabled kinds, in helper entry order
    pub fn types(&self) -> Vec<NamespaceType> {
        NamespaceType::ENTRY_ORDER
            .iter()
            .copied()
            .filter(|ns| self.contains(*ns))
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        [self.mnt, self.net, self.pid, self.uts, self.ipc]
            .iter()
            .filter(|&&x| x)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled_count() == 0
    }

    /// Bind every enabled kind to the namespaces of `pid`
    pub fn targets(&self, pid: u32) -> Vec<NamespaceTarget> {
        self.types()
            .into_iter()
            .map(|kind| NamespaceTarget { kind, pid })
            .collect()
    }
}

impl fmt::Display for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("host");
        }
        let names: Vec<&str> = self.types().iter().map(|ns| ns.proc_name()).collect();
        f.write_str(&names.join(","))
    }
}

/// One namespace-entry directive: enter `kind` of process `pid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceTarget {
    pub kind: NamespaceType,
    pub pid: u32,
}

impl NamespaceTarget {
    pub fn path(&self, proc_root: &str) -> PathBuf {
        self.kind.path_for(proc_root, self.pid)
    }
}

impl fmt::Display for NamespaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.pid)
    }
}
