//! Background process manager: namespace-scoped command execution
//!
//! Each execution is independent: it gets its own child process (and
//! process group), its own output buffers and its own cancellation. The
//! only state shared between executions is the in-flight table, used for
//! diagnostics.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chaos_core::util::pid_exists;
use chaos_core::{ChaosError, Result};
use chaos_namespace::helper::{EXIT_EXEC_DENIED, EXIT_EXEC_NOT_FOUND, EXIT_SETNS_FAILED, MARKER};
use chaos_namespace::{NamespaceSet, NamespaceTarget};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bpm::enter::CommandEnterer;

/// Per-stream cap on captured output; the rest is drained and dropped
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for a killed child to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long output is still collected after the child exited. Descendants
/// that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What to run and which namespaces to run it in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Namespace-entry directives; empty means the daemon's own namespaces
    pub targets: Vec<NamespaceTarget>,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl ExecSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            targets: Vec::new(),
            command,
            env: Vec::new(),
        }
    }

    /// Enter every namespace in `set` of process `pid`
    pub fn in_namespaces(mut self, set: NamespaceSet, pid: u32) -> Self {
        self.targets.extend(set.targets(pid));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.program().is_empty() {
            return Err(ChaosError::InvalidConfig(
                "Command cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.kind) {
                return Err(ChaosError::InvalidConfig(format!(
                    "Namespace {} requested twice",
                    target.kind
                )));
            }
        }

        Ok(())
    }

    fn describe_targets(&self) -> String {
        if self.targets.is_empty() {
            return "host".to_string();
        }
        let targets: Vec<String> = self.targets.iter().map(|t| t.to_string()).collect();
        targets.join(",")
    }
}

/// Result of one execution
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Process ID of the direct child
    pub pid: u32,
    /// Exit status (128 + signal if killed by a signal)
    pub exit_status: i32,
    /// Signal if killed
    pub signal: Option<i32>,
    /// Execution time in milliseconds
    pub exec_time_ms: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0 && self.signal.is_none()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr, for error reports
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout_lossy();
        let err = self.stderr_lossy();
        if !out.is_empty() && !err.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&err);
        out
    }

    /// A failure reported by the namespace-entry helper rather than the command
    fn helper_failure(&self) -> Option<ChaosError> {
        let line = self
            .stderr_lossy()
            .lines()
            .find(|line| line.starts_with(MARKER))?
            .trim_start_matches(MARKER)
            .trim()
            .to_string();

        match self.exit_status {
            EXIT_SETNS_FAILED if line.starts_with("Target gone") => {
                Some(ChaosError::TargetGone(line))
            }
            EXIT_SETNS_FAILED => Some(ChaosError::NamespaceEntry(line)),
            EXIT_EXEC_DENIED | EXIT_EXEC_NOT_FOUND => Some(ChaosError::Execution(line)),
            _ => None,
        }
    }
}

/// An execution that has been spawned and not yet reaped
#[derive(Debug, Clone)]
pub struct InFlightProcess {
    pub id: Uuid,
    pub pid: u32,
    pub command: String,
    pub namespaces: String,
    pub started_at: DateTime<Utc>,
}

type InFlightTable = Arc<Mutex<HashMap<Uuid, InFlightProcess>>>;

/// Removes the execution from the in-flight table when dropped and kills
/// its process group unless the child was reaped.
struct InFlightGuard {
    id: Uuid,
    pgid: u32,
    table: InFlightTable,
    reaped: bool,
}

impl InFlightGuard {
    fn register(table: InFlightTable, entry: InFlightProcess) -> Self {
        let guard = Self {
            id: entry.id,
            pgid: entry.pid,
            table: table.clone(),
            reaped: false,
        };
        table
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(entry.id, entry);
        guard
    }

    fn kill_group(&self) {
        match killpg(Pid::from_raw(self.pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", self.pgid, e),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
        }
        self.table
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&self.id);
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Spawns, tracks and cancels namespace-scoped executions
pub struct BackgroundProcessManager {
    enterer: Arc<dyn CommandEnterer>,
    in_flight: InFlightTable,
}

impl BackgroundProcessManager {
    pub fn new(enterer: Arc<dyn CommandEnterer>) -> Self {
        Self {
            enterer,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot of executions that are still running
    pub fn in_flight(&self) -> Vec<InFlightProcess> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Execute `spec` and wait for it.
    ///
    /// Returns `Cancelled` if `cancel` fires and `Timeout` if `deadline`
    /// elapses; in both cases the whole process group is killed and reaped
    /// before returning. Dropping the returned future also kills the group.
    /// A non-zero exit of the command is not an error.
    pub async fn execute(
        &self,
        spec: ExecSpec,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<ProcessResult> {
        spec.validate()?;

        for target in &spec.targets {
            if !pid_exists(self.enterer.proc_root(), target.pid) {
                return Err(ChaosError::TargetGone(format!(
                    "pid {} no longer exists",
                    target.pid
                )));
            }
        }

        let mut cmd = self.enterer.enter(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ChaosError::Execution(format!("spawn {}: {}", spec.program(), e)))?;

        let pid = child.id().ok_or_else(|| {
            ChaosError::Execution(format!("{} exited before it was tracked", spec.program()))
        })?;

        let mut guard = InFlightGuard::register(
            self.in_flight.clone(),
            InFlightProcess {
                id: Uuid::new_v4(),
                pid,
                command: spec.command.join(" "),
                namespaces: spec.describe_targets(),
                started_at: Utc::now(),
            },
        );
        debug!("Spawned pid {} for {:?} in {}", pid, spec.command, spec.describe_targets());

        let stop_reading = CancellationToken::new();
        let stdout = tokio::spawn(read_capped(child.stdout.take(), stop_reading.clone()));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), stop_reading.clone()));

        let outcome = {
            let expire = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                status = child.wait() => Outcome::Exited(status),
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = expire => Outcome::TimedOut,
            }
        };

        let status = match outcome {
            Outcome::Exited(status) => status,
            Outcome::Cancelled => {
                stop_reading.cancel();
                return Err(abort(&mut guard, &mut child, ChaosError::Cancelled).await);
            }
            Outcome::TimedOut => {
                stop_reading.cancel();
                return Err(abort(&mut guard, &mut child, ChaosError::Timeout).await);
            }
        };
        let status = status
            .map_err(|e| ChaosError::Execution(format!("waitpid {} failed: {}", pid, e)))?;
        guard.reaped = true;

        let (stdout, stderr) = {
            let pipes = async { tokio::join!(stdout, stderr) };
            tokio::pin!(pipes);
            let (out, err) = tokio::select! {
                done = &mut pipes => done,
                _ = tokio::time::sleep(DRAIN_GRACE) => {
                    debug!("pid {} exited with its output still open", pid);
                    stop_reading.cancel();
                    pipes.await
                }
            };
            (out.unwrap_or_default(), err.unwrap_or_default())
        };

        let signal = status.signal();
        let result = ProcessResult {
            pid,
            exit_status: status.code().unwrap_or_else(|| 128 + signal.unwrap_or(0)),
            signal,
            exec_time_ms: start.elapsed().as_millis() as u64,
            stdout,
            stderr,
        };

        if !spec.targets.is_empty()
            && let Some(err) = result.helper_failure()
        {
            return Err(err);
        }

        Ok(result)
    }
}

/// Kill and reap an execution that was cancelled or timed out
async fn abort(guard: &mut InFlightGuard, child: &mut Child, err: ChaosError) -> ChaosError {
    guard.kill_group();
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_)) => guard.reaped = true,
        Ok(Err(e)) => warn!("Failed to reap pid {}: {}", guard.pgid, e),
        Err(_) => warn!("pid {} not reaped within {:?}", guard.pgid, KILL_GRACE),
    }
    err
}

/// Read a pipe to the end (or until `stop`), keeping at most
/// [`MAX_OUTPUT_BYTES`]
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, stop: CancellationToken) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = tokio::select! {
            read = pipe.read(&mut buf) => read,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES.saturating_sub(out.len());
                out.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpm::enter::HostEnterer;

    fn manager() -> BackgroundProcessManager {
        BackgroundProcessManager::new(Arc::new(HostEnterer))
    }

    fn sh(script: &str) -> ExecSpec {
        ExecSpec::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_exec_spec_validate_empty_command() {
        assert!(ExecSpec::new(Vec::new()).validate().is_err());
        assert!(ExecSpec::new(vec![String::new()]).validate().is_err());
    }

    #[test]
    fn test_exec_spec_rejects_duplicate_namespace() {
        let spec = ExecSpec::new(vec!["true".to_string()])
            .in_namespaces(NamespaceSet::process_view(), 1)
            .in_namespaces(NamespaceSet::process_view(), 2);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_process_result_success() {
        let result = ProcessResult {
            pid: 1,
            exit_status: 0,
            signal: None,
            exec_time_ms: 5,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
        };
        assert!(result.success());
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[test]
    fn test_helper_failure_classification() {
        let mut result = ProcessResult {
            pid: 1,
            exit_status: EXIT_SETNS_FAILED,
            signal: None,
            exec_time_ms: 1,
            stdout: Vec::new(),
            stderr: format!("{} Namespace entry failed: setns net: EPERM\n", MARKER).into_bytes(),
        };
        assert!(matches!(
            result.helper_failure(),
            Some(ChaosError::NamespaceEntry(_))
        ));

        result.stderr = format!("{} Target gone: net namespace\n", MARKER).into_bytes();
        assert!(result.helper_failure().unwrap().is_target_gone());

        result.exit_status = EXIT_EXEC_NOT_FOUND;
        result.stderr = format!("{} exec ps: ENOENT\n", MARKER).into_bytes();
        assert!(matches!(
            result.helper_failure(),
            Some(ChaosError::Execution(_))
        ));

        result.stderr = b"ps: not found\n".to_vec();
        assert!(result.helper_failure().is_none());
    }

    #[tokio::test]
    async fn execute_captures_output_and_exit_code() {
        let result = manager()
            .execute(sh("echo out; echo err >&2; exit 3"), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.exit_status, 3);
        assert!(!result.success());
        assert_eq!(result.stdout_lossy(), "out\n");
        assert_eq!(result.stderr_lossy(), "err\n");
    }

    #[tokio::test]
    async fn execute_missing_program_is_execution_error() {
        let spec = ExecSpec::new(vec!["/definitely/not/here".to_string()]);
        let err = manager()
            .execute(spec, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::Execution(_)));
    }

    #[tokio::test]
    async fn execute_gone_target_is_target_gone() {
        let spec = sh("true").in_namespaces(NamespaceSet::process_view(), 999_999_999);
        let err = manager()
            .execute(spec, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_target_gone());
    }

    #[tokio::test]
    async fn execute_deadline_returns_timeout() {
        let bpm = manager();
        let err = bpm
            .execute(
                sh("sleep 30"),
                &CancellationToken::new(),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ChaosError::Timeout));
        assert!(bpm.in_flight().is_empty());
    }

    #[tokio::test]
    async fn execute_returns_when_command_exits_before_its_children() {
        let start = Instant::now();
        let result = manager()
            .execute(
                sh("sleep 30 & echo started"),
                &CancellationToken::new(),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_lossy(), "started\n");
        assert!(start.elapsed() < Duration::from_secs(3));

        let _ = killpg(Pid::from_raw(result.pid as i32), Signal::SIGKILL);
    }

    #[tokio::test]
    async fn execute_checks_targets_under_enterer_proc_root() {
        let proc_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(proc_root.path().join("999999/ns")).unwrap();
        let enterer = ProcRootEnterer {
            proc_root: proc_root.path().to_string_lossy().into_owned(),
        };
        let bpm = BackgroundProcessManager::new(Arc::new(enterer));

        let spec = sh("true").in_namespaces(NamespaceSet::process_view(), 999_999);
        let result = bpm
            .execute(spec, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(result.success());
    }

    /// Runs commands on the host but resolves PIDs under a custom procfs
    struct ProcRootEnterer {
        proc_root: String,
    }

    impl CommandEnterer for ProcRootEnterer {
        fn enter(&self, spec: &ExecSpec) -> tokio::process::Command {
            HostEnterer.enter(spec)
        }

        fn proc_root(&self) -> &str {
            &self.proc_root
        }
    }

    #[tokio::test]
    async fn output_is_capped() {
        let result = manager()
            .execute(
                sh("head -c 2000000 /dev/zero"),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.len(), MAX_OUTPUT_BYTES);
    }
}
