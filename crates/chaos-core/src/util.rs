//! Utility functions shared by the daemon and the controller

use crate::error::{ChaosError, Result};
use std::time::Duration;

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Check whether a process with the given PID still exists under `proc_root`
pub fn pid_exists(proc_root: &str, pid: u32) -> bool {
    std::path::Path::new(proc_root)
        .join(pid.to_string())
        .exists()
}

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, millis) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60 * 1000u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60 * 1000u64)
    } else {
        (s.as_str(), 1000u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| ChaosError::InvalidConfig(format!("Invalid duration: {}", s)))?;

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .ok_or_else(|| ChaosError::InvalidConfig(format!("Duration overflow: {}", s)))
}
