use console::style;
use log::{debug, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::web;
use chaos_controller::{
    ExperimentRunner, ExperimentStore, FileInventory, ReconcilerBuilder, ReconcilerConfig,
};
use chaos_core::Phase;
use chaos_core::capabilities::SystemCapabilities;
use chaos_core::util::parse_duration;
use chaos_daemon::{DaemonConfig, DaemonState, RuntimeConfig};
use tokio_util::sync::CancellationToken;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Configuration for the node daemon
pub struct DaemonRunConfig {
    pub bind: SocketAddr,
    pub nsexec: Option<PathBuf>,
    pub proc_root: String,
    pub timeout: String,
    pub runtime_map: Option<PathBuf>,
    pub list_command: String,
}

/// Configuration for an experiment run
pub struct ExperimentRunConfig {
    pub manifest: PathBuf,
    pub inventory: PathBuf,
    pub rpc_timeout: String,
    pub max_parallel: usize,
    pub resync: String,
    pub backoff_base: String,
    pub backoff_max: String,
    pub max_attempts: u32,
}

/// Cancel one of `tokens` per Ctrl-C, in order
fn cancel_on_ctrl_c(tokens: Vec<CancellationToken>) {
    actix_web::rt::spawn(async move {
        for token in tokens {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Received Ctrl-C");
            token.cancel();
        }
    });
}

pub async fn run_daemon(config: DaemonRunConfig) -> CliResult {
    let caps = SystemCapabilities::detect();
    debug!("{}", caps.summary());
    if config.nsexec.is_some() && !caps.can_enter_namespaces() {
        eprintln!(
            "{} namespace entry needs root with CAP_SYS_ADMIN; requests will fail",
            style("warning:").yellow().bold()
        );
    }

    let daemon_config = DaemonConfig {
        bind: config.bind,
        nsexec_path: config.nsexec,
        proc_root: config.proc_root,
        default_timeout: parse_duration(&config.timeout)?,
        list_command: config
            .list_command
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        runtime: match config.runtime_map {
            Some(path) => RuntimeConfig::Static(path),
            None => RuntimeConfig::ProcScan,
        },
    };

    let state = web::Data::new(DaemonState::from_config(&daemon_config)?);
    cancel_on_ctrl_c(vec![state.shutdown_token()]);

    chaos_daemon::serve(state, daemon_config.bind).await?;
    Ok(())
}

pub async fn run_experiment(config: ExperimentRunConfig) -> CliResult {
    let reconciler_config = ReconcilerConfig {
        rpc_timeout: parse_duration(&config.rpc_timeout)?,
        max_parallel: config.max_parallel,
        resync_interval: parse_duration(&config.resync)?,
        backoff_base: parse_duration(&config.backoff_base)?,
        backoff_max: parse_duration(&config.backoff_max)?,
        max_attempts: config.max_attempts,
    };
    debug!("{:?}", reconciler_config);

    let inventory = FileInventory::open(&config.inventory)?;
    let reconciler = ReconcilerBuilder::new(Arc::new(inventory))
        .config(reconciler_config)
        .build()?;

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let runner = ExperimentRunner::new(Arc::new(reconciler), ExperimentStore::new(&config.manifest))
        .abort_on(abort.clone());
    // first Ctrl-C recovers, a second one leaves the rest injected
    cancel_on_ctrl_c(vec![shutdown.clone(), abort]);
    let experiment = runner.run(shutdown).await?;

    let status = &experiment.status;
    println!(
        "\n{} {}: {} records, {} recovered, {} gone, {} still injected",
        style("Experiment").bold(),
        experiment.name,
        status.records.len(),
        status.count(Phase::NotInjected),
        status.count(Phase::NotExist),
        status.count(Phase::Injected)
    );

    for record in status.stalled() {
        if let Some(failure) = &record.failure {
            println!(
                "  {} {} {} failed after {} attempts: {}",
                style("✗").red(),
                record.id,
                failure.operation,
                failure.attempts,
                failure.last_error
            );
        }
    }

    if status.all_recovered {
        Ok(())
    } else {
        Err(format!(
            "{} records could not be recovered",
            status.count(Phase::Injected)
        )
        .into())
    }
}
