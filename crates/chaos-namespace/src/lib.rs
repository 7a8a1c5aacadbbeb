//! chaos-namespace: entering the Linux namespaces of a target process
//!
//! Provides the namespace kinds a fault can run in, `/proc` namespace
//! helpers, and the `chaos-nsexec` helper that performs the actual
//! setns(2) in a separate, re-executed process.

pub mod config;
pub mod enter;
pub mod helper;

pub use config::{NamespaceSet, NamespaceTarget, NamespaceType};
pub use helper::NsexecArgs;
