//! chaos-ctl - run the fault daemon and chaos experiments

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{check_requirements, list_fault_kinds};
use console::style;
use runner::{DaemonRunConfig, ExperimentRunConfig, run_daemon, run_experiment};

#[actix_web::main]
async fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    let result = match cli.command {
        Commands::Daemon {
            bind,
            nsexec,
            no_nsexec,
            proc_root,
            timeout,
            runtime_map,
            list_command,
        } => {
            run_daemon(DaemonRunConfig {
                bind,
                nsexec: (!no_nsexec).then_some(nsexec),
                proc_root,
                timeout,
                runtime_map,
                list_command,
            })
            .await
        }
        Commands::Run {
            manifest,
            inventory,
            rpc_timeout,
            max_parallel,
            resync,
            backoff_base,
            backoff_max,
            max_attempts,
        } => {
            run_experiment(ExperimentRunConfig {
                manifest,
                inventory,
                rpc_timeout,
                max_parallel,
                resync,
                backoff_base,
                backoff_max,
                max_attempts,
            })
            .await
        }
        Commands::Check {
            manifest,
            inventory,
        } => {
            if check_requirements(manifest.as_deref(), inventory.as_deref()) {
                Ok(())
            } else {
                Err("check failed".into())
            }
        }
        Commands::Kinds => {
            list_fault_kinds();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
