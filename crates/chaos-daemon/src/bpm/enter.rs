//! How an execution spec becomes a runnable command
//!
//! Namespace entry is OS-specific and privileged, so the engine only asks a
//! [`CommandEnterer`] for a ready-to-spawn [`Command`] and stays agnostic of
//! how the namespaces are joined.

use std::path::{Path, PathBuf};

use chaos_namespace::NsexecArgs;
use tokio::process::Command;

use crate::bpm::process::ExecSpec;

/// Environment variable [`HostEnterer`] uses to expose the namespace targets
pub const HOST_TARGETS_ENV: &str = "CHAOS_NS_TARGETS";

/// Builds the command that runs `spec` inside its target namespaces
pub trait CommandEnterer: Send + Sync {
    fn enter(&self, spec: &ExecSpec) -> Command;

    /// procfs mount the target PIDs are looked up in
    fn proc_root(&self) -> &str {
        "/proc"
    }
}

/// Re-executes the command under the `chaos-nsexec` helper
#[derive(Debug, Clone)]
pub struct HelperEnterer {
    helper: PathBuf,
    proc_root: String,
}

impl HelperEnterer {
    pub fn new(helper: impl AsRef<Path>, proc_root: &str) -> Self {
        Self {
            helper: helper.as_ref().to_path_buf(),
            proc_root: proc_root.to_string(),
        }
    }

    pub fn helper_args(&self, spec: &ExecSpec) -> Vec<String> {
        NsexecArgs::for_targets(&spec.targets, &self.proc_root, &spec.command).to_args()
    }
}

impl CommandEnterer for HelperEnterer {
    fn enter(&self, spec: &ExecSpec) -> Command {
        if spec.targets.is_empty() {
            return direct_command(spec);
        }

        let mut cmd = Command::new(&self.helper);
        cmd.args(self.helper_args(spec));
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn proc_root(&self) -> &str {
        &self.proc_root
    }
}

/// Runs the command in the daemon's own namespaces.
///
/// The targets that would have been entered are passed to the command in
/// `CHAOS_NS_TARGETS` (e.g. `pid:42,mnt:42`). Used on hosts without
/// container isolation and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostEnterer;

impl CommandEnterer for HostEnterer {
    fn enter(&self, spec: &ExecSpec) -> Command {
        let mut cmd = direct_command(spec);
        let targets: Vec<String> = spec.targets.iter().map(|t| t.to_string()).collect();
        cmd.env(HOST_TARGETS_ENV, targets.join(","));
        cmd
    }
}

fn direct_command(spec: &ExecSpec) -> Command {
    let mut cmd = Command::new(spec.program());
    cmd.args(&spec.command[1..]);
    cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_namespace::NamespaceSet;

    fn spec() -> ExecSpec {
        ExecSpec::new(vec!["ps".to_string(), "-e".to_string()])
            .in_namespaces(NamespaceSet::process_view(), 31)
    }

    #[test]
    fn helper_args_target_only_the_given_pid() {
        let enterer = HelperEnterer::new("/usr/local/bin/chaos-nsexec", "/proc");
        let args = enterer.helper_args(&spec());
        assert_eq!(
            args,
            vec!["-p", "/proc/31/ns/pid", "-m", "/proc/31/ns/mnt", "--", "ps", "-e"]
        );
    }

    #[test]
    fn helper_enterer_reports_its_proc_root() {
        let enterer = HelperEnterer::new("/usr/local/bin/chaos-nsexec", "/host/proc");
        assert_eq!(enterer.proc_root(), "/host/proc");
        assert_eq!(HostEnterer.proc_root(), "/proc");
    }

    #[test]
    fn helper_enterer_uses_helper_binary() {
        let enterer = HelperEnterer::new("/usr/local/bin/chaos-nsexec", "/proc");
        let cmd = enterer.enter(&spec());
        assert_eq!(
            cmd.as_std().get_program(),
            std::ffi::OsStr::new("/usr/local/bin/chaos-nsexec")
        );
    }

    #[test]
    fn helper_enterer_skips_helper_without_targets() {
        let enterer = HelperEnterer::new("/usr/local/bin/chaos-nsexec", "/proc");
        let cmd = enterer.enter(&ExecSpec::new(vec!["true".to_string()]));
        assert_eq!(cmd.as_std().get_program(), std::ffi::OsStr::new("true"));
    }

    #[test]
    fn host_enterer_exposes_targets() {
        let cmd = HostEnterer.enter(&spec());
        let env: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(env.iter().any(|(k, v)| {
            *k == HOST_TARGETS_ENV && v.map(|v| v == "pid:31,mnt:31").unwrap_or(false)
        }));
    }
}
