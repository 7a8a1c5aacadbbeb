//! chaos-daemon: the privileged per-node fault daemon
//!
//! - `bpm`: namespace-scoped process execution
//! - `runtime`: container identifier to PID resolution
//! - `proto`: request, response and error types shared with the controller
//! - `server`: the actix-web RPC server

pub mod bpm;
pub mod config;
pub mod proto;
pub mod runtime;
pub mod server;

pub use config::{DaemonConfig, RuntimeConfig};
pub use server::{DaemonState, configure, serve};
