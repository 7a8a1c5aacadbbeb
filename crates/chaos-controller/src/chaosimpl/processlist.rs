//! `process-list`: list the processes of the target container.
//!
//! Observational and one-shot: nothing is changed on the target, so there is
//! nothing to recover.

use chaos_core::Result;
use chaos_daemon::proto::ListProcessesRequest;
use log::info;
use serde::{Deserialize, Serialize};

use super::{FaultContext, FaultImpl, parse_params};

pub const KIND: &str = "process-list";
pub const DESCRIPTION: &str = "list the processes of each target container (one-shot)";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessListFault {}

impl ProcessListFault {
    pub fn construct(params: &serde_json::Value) -> Result<FaultImpl> {
        let fault: Self = parse_params(KIND, params)?;
        Ok(FaultImpl::ProcessList(fault))
    }

    pub async fn apply(&self, ctx: &FaultContext<'_>) -> Result<()> {
        let resp = ctx
            .daemon
            .list_processes(ListProcessesRequest {
                container_id: ctx.target.container_id.to_string(),
                timeout_ms: ctx.timeout_ms(),
            })
            .await?;

        let commands: Vec<&str> = resp.processes.iter().map(|p| p.command.as_str()).collect();
        info!(
            "{} runs {} processes: {}",
            ctx.target.id,
            resp.processes.len(),
            commands.join(", ")
        );
        Ok(())
    }
}
