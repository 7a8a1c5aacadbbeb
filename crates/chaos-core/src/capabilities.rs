//! Runtime detection of host capabilities needed for fault injection
//!
//! Inspects the running kernel and process to find out whether the daemon can
//! enter other processes' namespaces.

use std::path::Path;

/// Detected host capabilities
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// CAP_SYS_ADMIN is in the effective set (required by setns)
    pub has_sys_admin: bool,
    /// /proc exposes per-process namespace files
    pub has_proc_ns: bool,
    /// Host PID namespace is visible (daemon shares the host PID namespace)
    pub has_host_pid: bool,
}

impl SystemCapabilities {
    /// Detect all available capabilities on the current system
    pub fn detect() -> Self {
        Self {
            has_root: detect_root(),
            has_sys_admin: detect_sys_admin(),
            has_proc_ns: Path::new("/proc/self/ns/mnt").exists(),
            has_host_pid: detect_host_pid(),
        }
    }

    /// Check if the daemon can inject faults into other containers
    pub fn can_enter_namespaces(&self) -> bool {
        self.has_sys_admin && self.has_proc_ns
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        [
            format!("{} Root privileges", check(self.has_root)),
            format!("{} CAP_SYS_ADMIN", check(self.has_sys_admin)),
            format!("{} /proc namespace files", check(self.has_proc_ns)),
            format!("{} Host PID namespace", check(self.has_host_pid)),
        ]
        .join("\n")
    }
}

fn detect_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn detect_sys_admin() -> bool {
    const CAP_SYS_ADMIN: u32 = 21;

    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return detect_root();
    };

    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
        .map(|caps| caps & (1 << CAP_SYS_ADMIN) != 0)
        .unwrap_or(false)
}

fn detect_host_pid() -> bool {
    match (
        std::fs::read_link("/proc/self/ns/pid"),
        std::fs::read_link("/proc/1/ns/pid"),
    ) {
        (Ok(own), Ok(init)) => own == init && std::process::id() != 1,
        _ => false,
    }
}
