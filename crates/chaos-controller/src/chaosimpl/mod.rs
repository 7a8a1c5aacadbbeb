//! Fault kinds and the kind registry
//!
//! Every kind knows how to apply itself to one target and, unless it is
//! one-shot, how to undo that. Kinds are looked up by name in the
//! [`ImplRegistry`], which turns a manifest's `fault` section into a
//! [`FaultImpl`].

pub mod exec;
pub mod processlist;

use std::collections::BTreeMap;
use std::time::Duration;

use chaos_core::{ChaosError, Result};

use crate::client::FaultDaemon;
use crate::experiment::FaultSpec;
use crate::inventory::Target;

pub use exec::ExecFault;
pub use processlist::ProcessListFault;

/// Everything a kind needs to act on one target
pub struct FaultContext<'a> {
    pub daemon: &'a dyn FaultDaemon,
    pub target: &'a Target,
    /// Deadline the daemon enforces on the execution
    pub timeout: Duration,
}

impl FaultContext<'_> {
    pub fn timeout_ms(&self) -> Option<u64> {
        Some(self.timeout.as_millis() as u64)
    }
}

/// A configured fault of one of the built-in kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultImpl {
    ProcessList(ProcessListFault),
    Exec(ExecFault),
}

impl FaultImpl {
    pub fn kind(&self) -> &'static str {
        match self {
            FaultImpl::ProcessList(_) => processlist::KIND,
            FaultImpl::Exec(_) => exec::KIND,
        }
    }

    /// One-shot faults cannot be undone; recovering them is a no-op
    pub fn one_shot(&self) -> bool {
        match self {
            FaultImpl::ProcessList(_) => true,
            FaultImpl::Exec(f) => f.one_shot(),
        }
    }

    pub async fn apply(&self, ctx: &FaultContext<'_>) -> Result<()> {
        match self {
            FaultImpl::ProcessList(f) => f.apply(ctx).await,
            FaultImpl::Exec(f) => f.apply(ctx).await,
        }
    }

    pub async fn recover(&self, ctx: &FaultContext<'_>) -> Result<()> {
        if self.one_shot() {
            return Ok(());
        }
        match self {
            FaultImpl::ProcessList(_) => Ok(()),
            FaultImpl::Exec(f) => f.recover(ctx).await,
        }
    }
}

/// Builds a [`FaultImpl`] from a kind's parameters
pub type Constructor = fn(&serde_json::Value) -> Result<FaultImpl>;

struct KindEntry {
    constructor: Constructor,
    description: &'static str,
}

/// Kind name → constructor, built once at startup
pub struct ImplRegistry {
    kinds: BTreeMap<&'static str, KindEntry>,
}

impl ImplRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            processlist::KIND,
            processlist::DESCRIPTION,
            ProcessListFault::construct,
        );
        registry.register(exec::KIND, exec::DESCRIPTION, ExecFault::construct);
        registry
    }

    pub fn register(
        &mut self,
        kind: &'static str,
        description: &'static str,
        constructor: Constructor,
    ) {
        self.kinds.insert(
            kind,
            KindEntry {
                constructor,
                description,
            },
        );
    }

    pub fn build(&self, spec: &FaultSpec) -> Result<FaultImpl> {
        let entry = self
            .kinds
            .get(spec.kind.as_str())
            .ok_or_else(|| ChaosError::UnknownKind(spec.kind.clone()))?;
        (entry.constructor)(&spec.params)
    }

    /// `(kind, description)` pairs, sorted by kind
    pub fn kinds(&self) -> Vec<(&'static str, &'static str)> {
        self.kinds
            .iter()
            .map(|(kind, entry)| (*kind, entry.description))
            .collect()
    }
}

impl Default for ImplRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Deserialize kind parameters; a missing `params` section means defaults
pub(crate) fn parse_params<T: serde::de::DeserializeOwned + Default>(
    kind: &str,
    params: &serde_json::Value,
) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .map_err(|e| ChaosError::InvalidConfig(format!("Invalid {} parameters: {}", kind, e)))
}
