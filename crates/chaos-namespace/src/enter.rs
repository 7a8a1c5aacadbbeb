//! Namespace entry performed inside the helper process
//!
//! Everything here runs in the freshly started `chaos-nsexec` process and
//! ends in execvp(3). Nothing in this module is called from the daemon.

use std::ffi::CString;
use std::fs::File;
use std::path::PathBuf;

use chaos_core::{ChaosError, Result};
use nix::errno::Errno;
use nix::sched::setns;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, execvp, fork};

use crate::config::NamespaceType;
use crate::helper::{EXIT_EXEC_DENIED, EXIT_EXEC_NOT_FOUND, EXIT_SETNS_FAILED, MARKER, NsexecArgs};

/// Join every namespace in `entries`.
///
/// All files are opened before the first setns(2) so that paths are
/// resolved in the helper's original mount namespace.
pub fn enter_namespaces(entries: &[(NamespaceType, PathBuf)]) -> Result<()> {
    let mut files = Vec::with_capacity(entries.len());
    for (kind, path) in entries {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ChaosError::TargetGone(format!("{} namespace {}: {}", kind, path.display(), e))
            } else {
                ChaosError::NamespaceEntry(format!(
                    "open {} namespace {}: {}",
                    kind,
                    path.display(),
                    e
                ))
            }
        })?;
        files.push((*kind, path, file));
    }

    for (kind, path, file) in &files {
        setns(file, kind.clone_flag()).map_err(|e| {
            ChaosError::NamespaceEntry(format!("setns {} {}: {}", kind, path.display(), e))
        })?;
    }

    if entries.iter().any(|(kind, _)| *kind == NamespaceType::Mnt) {
        chdir("/").map_err(|e| ChaosError::NamespaceEntry(format!("chdir /: {}", e)))?;
    }

    Ok(())
}

/// Replace the current process image. Only returns on failure.
fn exec_command(command: &[String]) -> Errno {
    let Some(program) = command.first() else {
        return Errno::EINVAL;
    };

    let Ok(program) = CString::new(program.as_str()) else {
        return Errno::EINVAL;
    };

    let mut argv = Vec::with_capacity(command.len());
    for arg in command {
        match CString::new(arg.as_str()) {
            Ok(arg) => argv.push(arg),
            Err(_) => return Errno::EINVAL,
        }
    }

    match execvp(&program, &argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    }
}

fn exec_or_exit_code(command: &[String]) -> i32 {
    let errno = exec_command(command);
    let program = command.first().map(String::as_str).unwrap_or("<empty>");
    eprintln!("{} exec {}: {}", MARKER, program, errno);
    match errno {
        Errno::ENOENT => EXIT_EXEC_NOT_FOUND,
        _ => EXIT_EXEC_DENIED,
    }
}

/// Wait for the forked command and translate its status to an exit code
fn wait_for_child(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, status)) => return status,
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128 + signal as i32,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                eprintln!("{} waitpid failed: {}", MARKER, e);
                return EXIT_EXEC_DENIED;
            }
        }
    }
}

/// Helper entry point. Returns the exit code for the helper process.
///
/// Joining a PID namespace only affects children, so when one is requested
/// the helper forks once and the command runs in the child; the helper
/// waits and propagates the child's status.
pub fn run(args: &NsexecArgs) -> i32 {
    let entries = args.entries();

    if let Err(e) = enter_namespaces(&entries) {
        eprintln!("{} {}", MARKER, e);
        return EXIT_SETNS_FAILED;
    }

    if !entries.iter().any(|(kind, _)| *kind == NamespaceType::Pid) {
        return exec_or_exit_code(&args.command);
    }

    // SAFETY: the helper is single-threaded at this point
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // SAFETY: prctl with PR_SET_PDEATHSIG only affects this process
            unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            }
            std::process::exit(exec_or_exit_code(&args.command));
        }
        Ok(ForkResult::Parent { child }) => wait_for_child(child),
        Err(e) => {
            eprintln!("{} fork failed: {}", MARKER, e);
            EXIT_EXEC_DENIED
        }
    }
}
