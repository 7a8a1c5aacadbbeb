//! chaos-core: shared types, errors, and capability detection for chaos-rs
//!
//! This crate provides the foundational types used by the daemon, the
//! controller and the CLI:
//! - Error taxonomy and Result alias
//! - Record phase and runtime-qualified container identifiers
//! - Utility functions (duration parsing, PID checks)
//! - Host capability detection

pub mod capabilities;
pub mod error;
pub mod types;
pub mod util;

pub use error::{ChaosError, Result};
pub use types::{ContainerId, Phase};
