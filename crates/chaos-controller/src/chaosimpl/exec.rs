//! `exec`: run a command inside the target's namespaces.
//!
//! `apply` injects the fault, `recover` undoes it. Without a `recover`
//! command the fault is one-shot (e.g. killing a process).

use chaos_core::{ChaosError, Result};
use chaos_daemon::proto::ExecFaultRequest;
use chaos_namespace::NamespaceType;
use log::info;
use serde::{Deserialize, Serialize};

use super::{FaultContext, FaultImpl, parse_params};

pub const KIND: &str = "exec";
pub const DESCRIPTION: &str =
    "run an apply command in each target's namespaces, and a recover command to undo it";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecFault {
    pub apply: Vec<String>,
    #[serde(default)]
    pub recover: Vec<String>,
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<NamespaceType>,
}

fn default_namespaces() -> Vec<NamespaceType> {
    vec![NamespaceType::Mnt, NamespaceType::Pid, NamespaceType::Net]
}

impl Default for ExecFault {
    fn default() -> Self {
        Self {
            apply: Vec::new(),
            recover: Vec::new(),
            namespaces: default_namespaces(),
        }
    }
}

impl ExecFault {
    pub fn construct(params: &serde_json::Value) -> Result<FaultImpl> {
        let fault: Self = parse_params(KIND, params)?;
        fault.validate()?;
        Ok(FaultImpl::Exec(fault))
    }

    pub fn validate(&self) -> Result<()> {
        if self.apply.first().is_none_or(|p| p.is_empty()) {
            return Err(ChaosError::InvalidConfig(
                "exec fault requires an apply command".to_string(),
            ));
        }

        if self.namespaces.is_empty() {
            return Err(ChaosError::InvalidConfig(
                "exec fault requires at least one namespace".to_string(),
            ));
        }

        Ok(())
    }

    pub fn one_shot(&self) -> bool {
        self.recover.is_empty()
    }

    pub async fn apply(&self, ctx: &FaultContext<'_>) -> Result<()> {
        self.run(ctx, &self.apply).await?;
        info!("Applied {:?} to {}", self.apply, ctx.target.id);
        Ok(())
    }

    pub async fn recover(&self, ctx: &FaultContext<'_>) -> Result<()> {
        self.run(ctx, &self.recover).await?;
        info!("Recovered {} with {:?}", ctx.target.id, self.recover);
        Ok(())
    }

    async fn run(&self, ctx: &FaultContext<'_>, command: &[String]) -> Result<()> {
        ctx.daemon
            .exec(ExecFaultRequest {
                container_id: ctx.target.container_id.to_string(),
                command: command.to_vec(),
                namespaces: self.namespaces.clone(),
                timeout_ms: ctx.timeout_ms(),
            })
            .await
    }
}
