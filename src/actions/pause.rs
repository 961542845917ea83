//! Pause a container for the duration of the attack.

use super::execution::{Execution, ExecutionKind};
use super::params::Params;
use super::target::resolve_target;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter, PrepareResult,
    StartResult,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseState {
    execution_id: Uuid,
    container_id: String,
    pid: u32,
}

pub struct PauseContainer;

#[async_trait]
impl Action for PauseContainer {
    fn describe(&self) -> ActionDescription {
        ActionDescription::new(
            "pause",
            "Pause Container",
            "Pauses all processes of the container.",
            "state",
        )
        .parameter(Parameter::duration("30000"))
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        Params::new(&request.config).duration_ms()?;
        let target = resolve_target(ctx, request).await?;
        PrepareResult::new(&PauseState {
            execution_id: request.execution_id,
            container_id: target.container.id,
            pid: target.process.pid,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: PauseState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            ctx.client.pause(&state.container_id).await?;
            info!(execution_id = %state.execution_id, container = %state.container_id, "container paused");
            let execution = Execution::new(
                state.execution_id,
                ExecutionKind::Pause {
                    container_id: state.container_id.clone(),
                    pid: state.pid,
                },
            );
            let result = StartResult {
                messages: vec![Message::info(format!("container {} paused", state.container_id))],
                error: None,
            };
            Ok((execution, result))
        })
        .await
    }
}
