use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chaos-ctl")]
#[command(version, about = "Namespace-scoped fault injection for containers", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Node daemon (as root, one per node)
    chaos-ctl daemon --bind 0.0.0.0:31767

    # Daemon without namespace entry, containers mapped by a static file
    chaos-ctl daemon --no-nsexec --runtime-map pids.yaml

    # Run an experiment until its duration elapses or Ctrl-C
    chaos-ctl run experiment.yaml --inventory inventory.yaml

    # Validate files and inspect the host
    chaos-ctl check --manifest experiment.yaml --inventory inventory.yaml
    chaos-ctl kinds
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the per-node fault daemon
    Daemon {
        /// Listen address
        #[arg(short, long, value_name = "ADDR", default_value = "0.0.0.0:31767")]
        bind: SocketAddr,

        /// Namespace-entry helper
        #[arg(long, value_name = "PATH", default_value = "/usr/local/bin/chaos-nsexec")]
        nsexec: PathBuf,

        /// Run commands in the daemon's own namespaces
        #[arg(long, conflicts_with = "nsexec")]
        no_nsexec: bool,

        /// Host procfs mount point
        #[arg(long, value_name = "PATH", default_value = "/proc")]
        proc_root: String,

        /// Deadline for requests that do not carry one (30s, 2m)
        #[arg(short, long, value_name = "DURATION", default_value = "30s")]
        timeout: String,

        /// YAML map of container id to pid instead of scanning procfs
        #[arg(long, value_name = "PATH")]
        runtime_map: Option<PathBuf>,

        /// Command listing the processes of a container, one `PID COMMAND` per line
        #[arg(long, value_name = "CMD", default_value = "ps -eo pid=,comm=")]
        list_command: String,
    },

    /// Run an experiment until it is stopped, then recover it
    Run {
        /// Experiment manifest (YAML or JSON); status is written back to it
        manifest: PathBuf,

        /// Inventory of pods and node daemons
        #[arg(short, long, value_name = "PATH")]
        inventory: PathBuf,

        /// Deadline of each daemon call
        #[arg(long, value_name = "DURATION", default_value = "10s")]
        rpc_timeout: String,

        /// Targets operated on concurrently
        #[arg(long, value_name = "N", default_value_t = 8)]
        max_parallel: usize,

        /// Interval between passes
        #[arg(long, value_name = "DURATION", default_value = "5s")]
        resync: String,

        /// First retry delay after a failure
        #[arg(long, value_name = "DURATION", default_value = "1s")]
        backoff_base: String,

        /// Longest retry delay
        #[arg(long, value_name = "DURATION", default_value = "1m")]
        backoff_max: String,

        /// Attempts before a permanent failure is given up on
        #[arg(long, value_name = "N", default_value_t = 3)]
        max_attempts: u32,
    },

    /// Check host capabilities and validate files
    Check {
        /// Experiment manifest to validate
        #[arg(long, value_name = "PATH")]
        manifest: Option<PathBuf>,

        /// Inventory to validate
        #[arg(long, value_name = "PATH")]
        inventory: Option<PathBuf>,
    },

    /// List available fault kinds
    Kinds,
}
