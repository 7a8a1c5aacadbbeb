//! Error types for fault injection

use std::io;
use thiserror::Error;

/// Result type for chaos operations
pub type Result<T> = std::result::Result<T, ChaosError>;

/// Errors that can occur while resolving, injecting or recovering a fault
#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The node daemon could not resolve the container to a process
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// The target (pod, container or process) no longer exists
    #[error("Target gone: {0}")]
    TargetGone(String),

    /// The node daemon could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// setns(2) into a target namespace failed
    #[error("Namespace entry failed: {0}")]
    NamespaceEntry(String),

    /// The child process could not be started
    #[error("Execution error: {0}")]
    Execution(String),

    /// The injected command ran but the fault type treats its exit as a failure
    #[error("Command exited with code {exit_code}: {output}")]
    CommandFailed { exit_code: i32, output: String },

    #[error("Timeout exceeded")]
    Timeout,

    #[error("Execution cancelled")]
    Cancelled,

    /// Another Apply or Recover of the same record is still running
    #[error("Operation already in flight: {0}")]
    Busy(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown chaos kind: {0}")]
    UnknownKind(String),

    /// A structured error returned by the daemon that has no closer mapping
    #[error("RPC error ({code}): {message}")]
    Rpc { code: String, message: String },
}

impl ChaosError {
    /// The target disappeared; callers treat the record as already recovered.
    pub fn is_target_gone(&self) -> bool {
        matches!(
            self,
            ChaosError::ContainerNotFound(_) | ChaosError::TargetGone(_)
        )
    }

    /// Transient failures that the reconciliation loop retries with backoff
    /// and without an attempt limit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChaosError::Connection(_)
                | ChaosError::Timeout
                | ChaosError::Cancelled
                | ChaosError::Busy(_)
        )
    }
}
