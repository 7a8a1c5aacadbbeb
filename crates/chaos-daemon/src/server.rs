//! RPC server of the node daemon
//!
//! ## Endpoints
//!
//! GET  /health            - Liveness, version and in-flight executions
//! POST /api/v1/exec       - Run a command in a container's namespaces
//! POST /api/v1/processes  - List the processes visible in a container

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, ResponseError, web};
use chaos_core::{ChaosError, ContainerId, Result};
use chaos_namespace::NamespaceSet;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::bpm::{BackgroundProcessManager, CommandEnterer, ExecSpec, HelperEnterer, HostEnterer};
use crate::config::DaemonConfig;
use crate::proto::{
    EXEC_PATH, Empty, ErrorCode, ExecFaultRequest, HEALTH_PATH, HealthResponse,
    ListProcessesRequest, ListProcessesResponse, PROCESSES_PATH, ProcessEntry, RpcError,
};
use crate::runtime::ContainerRuntime;

/// Shared state of the daemon; nothing in here is per target
pub struct DaemonState {
    runtime: Arc<dyn ContainerRuntime>,
    bpm: BackgroundProcessManager,
    default_timeout: Duration,
    list_command: Vec<String>,
    shutdown: CancellationToken,
}

impl DaemonState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        enterer: Arc<dyn CommandEnterer>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            runtime,
            bpm: BackgroundProcessManager::new(enterer),
            default_timeout: config.default_timeout,
            list_command: config.list_command.clone(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        config.validate()?;

        let enterer: Arc<dyn CommandEnterer> = match &config.nsexec_path {
            Some(helper) => Arc::new(HelperEnterer::new(helper, &config.proc_root)),
            None => {
                warn!("No namespace helper configured; commands run in the daemon's namespaces");
                Arc::new(HostEnterer)
            }
        };

        Ok(Self::new(config.build_runtime()?, enterer, config))
    }

    pub fn bpm(&self) -> &BackgroundProcessManager {
        &self.bpm
    }

    /// Cancelling this token kills every in-flight execution and stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn deadline(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.default_timeout,
        }
    }

    async fn resolve(&self, container_id: &str) -> Result<(ContainerId, u32)> {
        let container: ContainerId = container_id.parse()?;
        let runtime = self.runtime.clone();
        let lookup = container.clone();
        let pid = web::block(move || runtime.pid_of(&lookup))
            .await
            .map_err(|e| ChaosError::Execution(format!("container lookup aborted: {}", e)))??;
        debug!("{} resolved to pid {} by {}", container, pid, self.runtime.name());
        Ok((container, pid))
    }
}

/// A [`ChaosError`] rendered as an [`RpcError`] body
#[derive(Debug)]
pub struct ApiError(pub ChaosError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ChaosError> for ApiError {
    fn from(err: ChaosError) -> Self {
        Self(err)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        let code = RpcError::from(&self.0).code;
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(RpcError::from(&self.0))
    }
}

type ApiResult<T> = std::result::Result<web::Json<T>, ApiError>;

async fn health(state: web::Data<DaemonState>) -> web::Json<HealthResponse> {
    web::Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        in_flight: state.bpm.in_flight().len(),
    })
}

async fn exec_fault(
    state: web::Data<DaemonState>,
    req: web::Json<ExecFaultRequest>,
) -> ApiResult<Empty> {
    let req = req.into_inner();
    info!(
        "exec request for {}: {:?} (namespaces {:?}, timeout {:?}ms)",
        req.container_id, req.command, req.namespaces, req.timeout_ms
    );
    let result = run_exec(&state, &req).await;
    if let Err(e) = &result {
        warn!("exec on {} failed: {}", req.container_id, e);
    }
    result.map(web::Json).map_err(ApiError)
}

async fn run_exec(state: &DaemonState, req: &ExecFaultRequest) -> Result<Empty> {
    if req.namespaces.is_empty() {
        return Err(ChaosError::InvalidConfig(
            "exec fault requires at least one namespace".to_string(),
        ));
    }

    let (container, pid) = state.resolve(&req.container_id).await?;
    let namespaces = NamespaceSet::from_types(&req.namespaces);
    info!(
        "exec in {} resolved to pid {}, entering {}",
        container, pid, namespaces
    );

    let spec = ExecSpec::new(req.command.clone()).in_namespaces(namespaces, pid);
    let cancel = state.shutdown.child_token();
    let result = state
        .bpm
        .execute(spec, &cancel, Some(state.deadline(req.timeout_ms)))
        .await?;

    info!(
        "exec in {} finished: exit {} in {}ms, output: {}",
        container,
        result.exit_status,
        result.exec_time_ms,
        result.combined_output().trim_end()
    );

    if !result.success() {
        return Err(ChaosError::CommandFailed {
            exit_code: result.exit_status,
            output: result.combined_output(),
        });
    }

    Ok(Empty {})
}

async fn list_processes(
    state: web::Data<DaemonState>,
    req: web::Json<ListProcessesRequest>,
) -> ApiResult<ListProcessesResponse> {
    let req = req.into_inner();
    info!(
        "process list request for {} (timeout {:?}ms)",
        req.container_id, req.timeout_ms
    );
    let result = run_list_processes(&state, &req).await;
    if let Err(e) = &result {
        warn!("process listing of {} failed: {}", req.container_id, e);
    }
    result.map(web::Json).map_err(ApiError)
}

async fn run_list_processes(
    state: &DaemonState,
    req: &ListProcessesRequest,
) -> Result<ListProcessesResponse> {
    let (container, pid) = state.resolve(&req.container_id).await?;
    let namespaces = NamespaceSet::process_view();
    info!(
        "process list of {} resolved to pid {}, entering {}",
        container, pid, namespaces
    );

    let spec = ExecSpec::new(state.list_command.clone()).in_namespaces(namespaces, pid);
    let cancel = state.shutdown.child_token();
    let result = state
        .bpm
        .execute(spec, &cancel, Some(state.deadline(req.timeout_ms)))
        .await?;

    if !result.success() {
        return Err(ChaosError::CommandFailed {
            exit_code: result.exit_status,
            output: result.combined_output(),
        });
    }

    let processes = parse_process_list(&result.stdout_lossy());
    info!(
        "{} has {} processes ({}ms), output: {}",
        container,
        processes.len(),
        result.exec_time_ms,
        result.combined_output().trim_end()
    );

    Ok(ListProcessesResponse { processes })
}

/// Parse `PID COMMAND` lines; anything else (headers, blanks) is skipped
pub fn parse_process_list(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// Register the daemon's routes on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let body = RpcError::new(ErrorCode::InvalidRequest, err.to_string());
        actix_web::error::InternalError::from_response(err, HttpResponse::BadRequest().json(body))
            .into()
    }))
    .route(HEALTH_PATH, web::get().to(health))
    .route(EXEC_PATH, web::post().to(exec_fault))
    .route(PROCESSES_PATH, web::post().to(list_processes));
}

/// Serve until the state's shutdown token is cancelled
pub async fn serve(state: web::Data<DaemonState>, bind: SocketAddr) -> std::io::Result<()> {
    let shutdown = state.shutdown_token();

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(bind)?
        .disable_signals()
        .run();

    info!("Fault daemon listening on http://{}", bind);

    let handle = server.handle();
    actix_web::rt::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutting down fault daemon");
        handle.stop(true).await;
    });

    server.await
}
