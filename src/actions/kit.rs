//! The action catalog bound to one [`ActionContext`].

use super::fill_disk::FillDisk;
use super::fill_memory::FillMemory;
use super::network::{NetworkAttack, NetworkKind};
use super::pause::PauseContainer;
use super::stop_container::StopContainer;
use super::stress::StressAttack;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, PrepareResult, StartResult,
    StatusResult, StopResult,
};
use crate::error::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

/// All attacks of the agent, addressable by id.
pub struct ActionKit {
    ctx: Arc<ActionContext>,
    actions: Vec<Arc<dyn Action>>,
}

impl ActionKit {
    pub fn new(ctx: Arc<ActionContext>) -> Self {
        let mut actions: Vec<Arc<dyn Action>> = vec![
            Arc::new(StopContainer),
            Arc::new(PauseContainer),
            Arc::new(StressAttack::cpu()),
            Arc::new(StressAttack::mem()),
            Arc::new(StressAttack::io()),
            Arc::new(FillDisk),
            Arc::new(FillMemory),
        ];
        actions.extend(
            NetworkKind::ALL
                .into_iter()
                .map(|kind| Arc::new(NetworkAttack::new(kind)) as Arc<dyn Action>),
        );
        Self { ctx, actions }
    }

    pub fn context(&self) -> &Arc<ActionContext> {
        &self.ctx
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    pub fn action(&self, id: &str) -> Result<&Arc<dyn Action>> {
        self.actions
            .iter()
            .find(|a| a.id() == id)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown action '{id}'")))
    }

    pub fn describe_all(&self) -> Vec<ActionDescription> {
        self.actions.iter().map(|a| a.describe()).collect()
    }

    pub async fn prepare(&self, id: &str, request: &ActionRequest) -> Result<PrepareResult> {
        self.action(id)?.prepare(&self.ctx, request).await
    }

    pub async fn start(&self, id: &str, state: &Value) -> Result<StartResult> {
        self.action(id)?.start(&self.ctx, state).await
    }

    pub async fn status(&self, id: &str, state: &Value) -> Result<StatusResult> {
        self.action(id)?.status(&self.ctx, state).await
    }

    pub async fn stop(&self, id: &str, state: &Value) -> Result<StopResult> {
        self.action(id)?.stop(&self.ctx, state).await
    }

    /// Stops every running execution.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown().await
    }
}
