//! Execution layer: namespace-scoped process management
//!
//! This module builds commands bound to target namespaces, runs them as
//! independent child processes, captures their output and exit status, and
//! kills them when the caller cancels or the deadline elapses.

pub mod enter;
pub mod process;

pub use enter::{CommandEnterer, HelperEnterer, HostEnterer};
pub use process::{BackgroundProcessManager, ExecSpec, InFlightProcess, ProcessResult};
