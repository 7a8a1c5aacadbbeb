//! Cancellation and isolation tests for the background process manager

use std::sync::Arc;
use std::time::{Duration, Instant};

use chaos_core::ChaosError;
use chaos_daemon::bpm::{BackgroundProcessManager, ExecSpec, HostEnterer};
use chaos_namespace::NamespaceSet;
use tokio_util::sync::CancellationToken;

/// True while `pid` exists and is not a zombie
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn wait_for_in_flight(bpm: &BackgroundProcessManager) -> u32 {
    let start = Instant::now();
    loop {
        if let Some(process) = bpm.in_flight().first() {
            return process.pid;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "execution never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_gone(pid: u32) {
    let start = Instant::now();
    while is_running(pid) {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "pid {} survived cancellation",
            pid
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn sleeper() -> ExecSpec {
    ExecSpec::new(vec!["sleep".to_string(), "30".to_string()])
        .in_namespaces(NamespaceSet::process_view(), std::process::id())
}

#[tokio::test]
async fn test_cancel_kills_child() {
    let bpm = Arc::new(BackgroundProcessManager::new(Arc::new(HostEnterer)));
    let cancel = CancellationToken::new();

    let task = {
        let bpm = bpm.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bpm.execute(sleeper(), &cancel, None).await })
    };

    let pid = wait_for_in_flight(&bpm).await;
    assert!(is_running(pid));

    let started = Instant::now();
    cancel.cancel();
    let result = task.await.unwrap();

    assert!(matches!(result, Err(ChaosError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!is_running(pid));
    assert!(bpm.in_flight().is_empty());
}

#[tokio::test]
async fn test_cancel_kills_whole_process_group() {
    let bpm = Arc::new(BackgroundProcessManager::new(Arc::new(HostEnterer)));
    let cancel = CancellationToken::new();
    let tmp = tempfile::tempdir().unwrap();
    let pidfile = tmp.path().join("grandchild.pid");

    let spec = ExecSpec::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("sleep 30 & echo $! > {}; wait", pidfile.display()),
    ]);

    let task = {
        let bpm = bpm.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bpm.execute(spec, &cancel, None).await })
    };

    wait_for_in_flight(&bpm).await;
    let start = Instant::now();
    let grandchild = loop {
        if let Some(pid) = std::fs::read_to_string(&pidfile)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
        {
            break pid;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(ChaosError::Cancelled)));
    wait_until_gone(grandchild).await;
}

#[tokio::test]
async fn test_dropping_execution_kills_child() {
    let bpm = Arc::new(BackgroundProcessManager::new(Arc::new(HostEnterer)));

    let task = {
        let bpm = bpm.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            bpm.execute(sleeper(), &cancel, None).await
        })
    };

    let pid = wait_for_in_flight(&bpm).await;
    task.abort();
    let _ = task.await;

    wait_until_gone(pid).await;
    assert!(bpm.in_flight().is_empty());
}

#[tokio::test]
async fn test_concurrent_executions_are_independent() {
    let bpm = Arc::new(BackgroundProcessManager::new(Arc::new(HostEnterer)));
    let cancel_first = CancellationToken::new();
    let cancel_second = CancellationToken::new();

    let first = {
        let bpm = bpm.clone();
        let cancel = cancel_first.clone();
        tokio::spawn(async move { bpm.execute(sleeper(), &cancel, None).await })
    };
    let second = {
        let bpm = bpm.clone();
        let cancel = cancel_second.clone();
        let spec = ExecSpec::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep 0.3; echo done".to_string(),
        ]);
        tokio::spawn(async move { bpm.execute(spec, &cancel, None).await })
    };

    cancel_first.cancel();
    assert!(matches!(first.await.unwrap(), Err(ChaosError::Cancelled)));

    let result = second.await.unwrap().unwrap();
    assert!(result.success());
    assert_eq!(result.stdout_lossy(), "done\n");
}
