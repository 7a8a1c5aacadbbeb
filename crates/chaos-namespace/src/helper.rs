//! Command-line contract of the `chaos-nsexec` namespace-entry helper
//!
//! The daemon never calls setns(2) itself. It re-executes the target command
//! under the helper, which takes one option per namespace file and the
//! command after `--`:
//!
//! ```text
//! chaos-nsexec -m /proc/4242/ns/mnt -p /proc/4242/ns/pid -- ps -eo pid=,comm=
//! ```
//!
//! Helper failures are reported on stderr with a line starting with
//! [`MARKER`] and one of the exit codes below. Any other exit code belongs to
//! the command.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{NamespaceTarget, NamespaceType};

/// Binary name of the helper
pub const HELPER_NAME: &str = "chaos-nsexec";

/// Prefix of every diagnostic line the helper writes itself
pub const MARKER: &str = "chaos-nsexec:";

/// A namespace file could not be opened or joined
pub const EXIT_SETNS_FAILED: i32 = 125;

/// The command exists but could not be executed
pub const EXIT_EXEC_DENIED: i32 = 126;

/// The command was not found inside the target mount namespace
pub const EXIT_EXEC_NOT_FOUND: i32 = 127;

/// Arguments accepted by `chaos-nsexec`
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = HELPER_NAME)]
#[command(version, about = "Run a command inside the namespaces of another process", long_about = None)]
pub struct NsexecArgs {
    /// Mount namespace file
    #[arg(short = 'm', long = "mnt", value_name = "PATH")]
    pub mnt: Option<PathBuf>,

    /// Network namespace file
    #[arg(short = 'n', long = "net", value_name = "PATH")]
    pub net: Option<PathBuf>,

    /// PID namespace file
    #[arg(short = 'p', long = "pid", value_name = "PATH")]
    pub pid: Option<PathBuf>,

    /// UTS namespace file
    #[arg(short = 'u', long = "uts", value_name = "PATH")]
    pub uts: Option<PathBuf>,

    /// IPC namespace file
    #[arg(short = 'i', long = "ipc", value_name = "PATH")]
    pub ipc: Option<PathBuf>,

    /// Command and arguments to run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl NsexecArgs {
    /// Build helper arguments for a set of namespace-entry directives
    pub fn for_targets(targets: &[NamespaceTarget], proc_root: &str, command: &[String]) -> Self {
        let mut args = Self {
            mnt: None,
            net: None,
            pid: None,
            uts: None,
            ipc: None,
            command: command.to_vec(),
        };

        for target in targets {
            let path = Some(target.path(proc_root));
            match target.kind {
                NamespaceType::Mnt => args.mnt = path,
                NamespaceType::Net => args.net = path,
                NamespaceType::Pid => args.pid = path,
                NamespaceType::Uts => args.uts = path,
                NamespaceType::Ipc => args.ipc = path,
            }
        }

        args
    }

    fn slot(&self, kind: NamespaceType) -> Option<&PathBuf> {
        match kind {
            NamespaceType::Mnt => self.mnt.as_ref(),
            NamespaceType::Net => self.net.as_ref(),
            NamespaceType::Pid => self.pid.as_ref(),
            NamespaceType::Uts => self.uts.as_ref(),
            NamespaceType::Ipc => self.ipc.as_ref(),
        }
    }

    /// Namespace files to join, in entry order
    pub fn entries(&self) -> Vec<(NamespaceType, PathBuf)> {
        NamespaceType::ENTRY_ORDER
            .iter()
            .filter_map(|kind| self.slot(*kind).map(|path| (*kind, path.clone())))
            .collect()
    }

    /// Render as an argv tail (without the helper path itself)
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (kind, path) in self.entries() {
            out.push(kind.helper_flag().to_string());
            out.push(path.to_string_lossy().into_owned());
        }
        out.push("--".to_string());
        out.extend(self.command.iter().cloned());
        out
    }
}
