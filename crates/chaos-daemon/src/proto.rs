//! Wire protocol between the controller and the node daemon
//!
//! Every fault type is a separate route on the same server. Requests carry
//! the opaque container identifier plus fault-specific parameters; a
//! successful call answers with the route's response body, a failed call with
//! an [`RpcError`] and an HTTP status derived from its [`ErrorCode`].

use chaos_core::ChaosError;
use chaos_namespace::NamespaceType;
use serde::{Deserialize, Serialize};

pub const HEALTH_PATH: &str = "/health";
pub const EXEC_PATH: &str = "/api/v1/exec";
pub const PROCESSES_PATH: &str = "/api/v1/processes";

/// Run a command inside the namespaces of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFaultRequest {
    pub container_id: String,
    pub command: Vec<String>,
    pub namespaces: Vec<NamespaceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// List the processes visible inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListProcessesRequest {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListProcessesResponse {
    pub processes: Vec<ProcessEntry>,
}

/// Body of a successful call with nothing to report
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ContainerNotFound,
    TargetGone,
    NamespaceEntry,
    Execution,
    CommandFailed,
    Timeout,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ContainerNotFound => 404,
            ErrorCode::TargetGone => 410,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::CommandFailed => 422,
            ErrorCode::Timeout => 504,
            ErrorCode::Cancelled => 499,
            ErrorCode::NamespaceEntry | ErrorCode::Execution | ErrorCode::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ContainerNotFound => "container_not_found",
            ErrorCode::TargetGone => "target_gone",
            ErrorCode::NamespaceEntry => "namespace_entry",
            ErrorCode::Execution => "execution",
            ErrorCode::CommandFailed => "command_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Structured failure returned by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: None,
            output: None,
        }
    }
}

impl From<&ChaosError> for RpcError {
    fn from(err: &ChaosError) -> Self {
        let code = match err {
            ChaosError::ContainerNotFound(_) => ErrorCode::ContainerNotFound,
            ChaosError::TargetGone(_) => ErrorCode::TargetGone,
            ChaosError::NamespaceEntry(_) => ErrorCode::NamespaceEntry,
            ChaosError::Execution(_) => ErrorCode::Execution,
            ChaosError::Timeout => ErrorCode::Timeout,
            ChaosError::Cancelled => ErrorCode::Cancelled,
            ChaosError::InvalidConfig(_) | ChaosError::Decode(_) => ErrorCode::InvalidRequest,
            ChaosError::CommandFailed { exit_code, output } => {
                return Self {
                    code: ErrorCode::CommandFailed,
                    message: err.to_string(),
                    exit_code: Some(*exit_code),
                    output: Some(output.clone()),
                };
            }
            _ => ErrorCode::Internal,
        };

        Self::new(code, inner_message(err))
    }
}

/// The variant payload without the Display prefix, so it survives a round
/// trip through the wire without being prefixed twice.
fn inner_message(err: &ChaosError) -> String {
    match err {
        ChaosError::ContainerNotFound(m)
        | ChaosError::TargetGone(m)
        | ChaosError::NamespaceEntry(m)
        | ChaosError::Execution(m)
        | ChaosError::InvalidConfig(m)
        | ChaosError::Decode(m) => m.clone(),
        other => other.to_string(),
    }
}

impl From<RpcError> for ChaosError {
    fn from(err: RpcError) -> Self {
        match err.code {
            ErrorCode::ContainerNotFound => ChaosError::ContainerNotFound(err.message),
            ErrorCode::TargetGone => ChaosError::TargetGone(err.message),
            ErrorCode::NamespaceEntry => ChaosError::NamespaceEntry(err.message),
            ErrorCode::Execution => ChaosError::Execution(err.message),
            ErrorCode::Timeout => ChaosError::Timeout,
            ErrorCode::Cancelled => ChaosError::Cancelled,
            ErrorCode::InvalidRequest => ChaosError::InvalidConfig(err.message),
            ErrorCode::CommandFailed => ChaosError::CommandFailed {
                exit_code: err.exit_code.unwrap_or(-1),
                output: err.output.unwrap_or_default(),
            },
            ErrorCode::Internal => ChaosError::Rpc {
                code: err.code.as_str().to_string(),
                message: err.message,
            },
        }
    }
}
