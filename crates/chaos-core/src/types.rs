//! Shared domain types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ChaosError, Result};

/// Lifecycle state of one injection target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// No fault is active on the target
    #[default]
    NotInjected,
    /// The fault was applied and has not been recovered
    Injected,
    /// The target disappeared; terminal for the record
    NotExist,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::NotExist)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::NotInjected => "NotInjected",
            Phase::Injected => "Injected",
            Phase::NotExist => "NotExist",
        };
        f.write_str(s)
    }
}

/// A runtime-qualified container identifier, e.g. `containerd://4f2a...`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId {
    runtime: String,
    id: String,
}

impl ContainerId {
    pub fn new(runtime: &str, id: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            id: id.to_string(),
        }
    }

    /// Runtime prefix (`containerd`, `docker`, `cri-o`)
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Bare container hash without the runtime prefix
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for ContainerId {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self> {
        let (runtime, id) = s.split_once("://").ok_or_else(|| {
            ChaosError::Decode(format!("container id without runtime prefix: {}", s))
        })?;

        if runtime.is_empty() || id.is_empty() {
            return Err(ChaosError::Decode(format!("malformed container id: {}", s)));
        }

        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ChaosError::Decode(format!(
                "container id contains invalid characters: {}",
                s
            )));
        }

        Ok(Self::new(runtime, id))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}
