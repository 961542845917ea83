//! Stop a container.
//!
//! A graceful stop may take as long as the container's grace period, so the
//! runtime call runs in a background task. Start waits briefly for an early
//! result; status reports once the task is done. Stopping the attack while
//! the call is pending aborts it, which does not revive the container.

use super::execution::{Execution, ExecutionKind, StopOutcome};
use super::params::Params;
use super::target::resolve_container;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter,
    ParameterKind, PrepareResult, StartResult,
};
use crate::constants::STOP_EARLY_EXIT_WAIT;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopState {
    execution_id: Uuid,
    container_id: String,
    graceful: bool,
}

pub struct StopContainer;

#[async_trait]
impl Action for StopContainer {
    fn describe(&self) -> ActionDescription {
        ActionDescription::new("stop", "Stop Container", "Stops the container.", "state")
            .instantaneous()
            .parameter(
                Parameter::new("graceful", "Graceful", ParameterKind::Boolean).default_value("true"),
            )
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        let graceful = Params::new(&request.config).bool_or("graceful", true)?;
        let container = resolve_container(ctx, request).await?;
        PrepareResult::new(&StopState {
            execution_id: request.execution_id,
            container_id: container.id,
            graceful,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: StopState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            let (tx, mut rx) = watch::channel::<Option<StopOutcome>>(None);
            let client = ctx.client.clone();
            let container_id = state.container_id.clone();
            let graceful = state.graceful;
            let execution_id = state.execution_id;

            let task = tokio::spawn(async move {
                info!(execution_id = %execution_id, container = %container_id, graceful, "stopping container");
                let outcome = match client.stop(&container_id, graceful).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(execution_id = %execution_id, container = %container_id, "failed to stop container: {}", e);
                        Err(e.to_string())
                    }
                };
                tx.send_replace(Some(outcome));
            });

            let early = tokio::time::timeout(STOP_EARLY_EXIT_WAIT, rx.wait_for(|o| o.is_some()))
                .await
                .ok()
                .and_then(|r| r.ok().map(|o| o.clone()))
                .flatten();

            let mut result = StartResult::default();
            match early {
                Some(Err(e)) => {
                    return Err(Error::RuntimeIo {
                        command: format!("stop {}", state.container_id),
                        stderr: e,
                    });
                }
                Some(Ok(())) => result
                    .messages
                    .push(Message::info(format!("container {} stopped", state.container_id))),
                None => result.messages.push(Message::info(format!(
                    "stopping container {}",
                    state.container_id
                ))),
            }
            let execution = Execution::new(
                state.execution_id,
                ExecutionKind::StopContainer {
                    container_id: state.container_id.clone(),
                    task,
                    outcome: rx,
                },
            );
            Ok((execution, result))
        })
        .await
    }
}
