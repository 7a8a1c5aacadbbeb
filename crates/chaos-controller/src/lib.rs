//! chaos-controller: the cluster side of chaos-rs
//!
//! Expands an experiment's selector into per-target records, decodes each
//! record to the daemon of its node and drives the Apply/Recover lifecycle
//! until the experiment converges.

pub mod chaosimpl;
pub mod client;
pub mod decoder;
pub mod experiment;
pub mod inventory;
pub mod reconciler;
pub mod runner;
pub mod store;

pub use chaosimpl::{FaultImpl, ImplRegistry};
pub use client::{ClientPool, DaemonClient, DaemonConnector, FaultDaemon, HttpConnector};
pub use decoder::Decoder;
pub use experiment::{DesiredState, Experiment, Record, RecordId};
pub use inventory::{FileInventory, Inventory, Target, TargetResolver};
pub use reconciler::{PassOutcome, Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use runner::ExperimentRunner;
pub use store::ExperimentStore;
