//! Running executions and their completion rules.
//!
//! | Kind            | Completed when                       | Finish                       |
//! |-----------------|--------------------------------------|------------------------------|
//! | `Sidecar`       | sidecar exited (see below)           | stop sidecar, run cleanup    |
//! | `Network`       | never on its own                     | revert batches               |
//! | `StopContainer` | background stop returned             | abort a pending stop         |
//! | `Pause`         | target process gone                  | unpause                      |
//!
//! Sidecar exits are classified as:
//!
//! - `0`: completed if the attack ends with its process, else still active;
//! - listed in `ignore_exit_codes`: completed with a warning;
//! - `-1` with the target gone: completed with a warning;
//! - stderr containing `tolerated_stderr`: still active;
//! - anything else: completed with an error.

use super::{ActionContext, ActionError, Message, StatusResult};
use crate::constants::{EXIT_CODE_SIGNALED, SIDECAR_EARLY_EXIT_WAIT};
use crate::error::{Error, Result};
use crate::network::AppliedNetwork;
use crate::runtime::ProcessExit;
use crate::sidecar::{Sidecar, SidecarOpts, SidecarSpec};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of the background stop of a container.
pub type StopOutcome = std::result::Result<(), String>;

/// How the exit of a long-running sidecar is judged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPolicy {
    #[serde(default)]
    pub ignore_exit_codes: Vec<i32>,
    /// Exit 0 ends the attack.
    #[serde(default)]
    pub completes_on_exit: bool,
    /// Exits whose stderr contains this keep the attack active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_stderr: Option<String>,
}

impl ExitPolicy {
    /// The attack ends with the sidecar.
    pub fn until_exit() -> Self {
        Self {
            completes_on_exit: true,
            ..Self::default()
        }
    }

    pub fn ignoring(mut self, codes: &[i32]) -> Self {
        self.ignore_exit_codes.extend_from_slice(codes);
        self
    }

    pub fn tolerating(mut self, stderr: &str) -> Self {
        self.tolerated_stderr = Some(stderr.to_string());
        self
    }
}

/// A long-running sidecar attack.
#[derive(Debug)]
pub struct SidecarExecution {
    pub sidecar: Sidecar,
    pub opts: SidecarOpts,
    pub policy: ExitPolicy,
    /// One-shot sidecar run after the main sidecar stopped.
    pub cleanup: Option<SidecarSpec>,
}

#[derive(Debug)]
pub enum ExecutionKind {
    Sidecar(Box<SidecarExecution>),
    Network(Box<AppliedNetwork>),
    StopContainer {
        container_id: String,
        task: JoinHandle<()>,
        outcome: watch::Receiver<Option<StopOutcome>>,
    },
    Pause {
        container_id: String,
        pid: u32,
    },
}

/// A registered execution.
#[derive(Debug)]
pub struct Execution {
    id: Uuid,
    kind: ExecutionKind,
    finished: bool,
}

impl Execution {
    pub fn new(id: Uuid, kind: ExecutionKind) -> Self {
        Self {
            id,
            kind,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &ExecutionKind {
        &self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Current status; `completed` results still need [`Self::finish`].
    pub fn poll(&self, ctx: &ActionContext) -> StatusResult {
        if self.finished {
            return StatusResult::completed();
        }
        match &self.kind {
            ExecutionKind::Sidecar(exec) => match exec.sidecar.exited() {
                None => StatusResult::running(),
                Some(exit) => classify_exit(exec, &exit, ctx.target_alive(exec.opts.target.pid)),
            },
            ExecutionKind::Network(_) => StatusResult::running(),
            ExecutionKind::StopContainer {
                container_id,
                outcome,
                ..
            } => match &*outcome.borrow() {
                None => StatusResult::running(),
                Some(Ok(())) => StatusResult {
                    completed: true,
                    messages: vec![Message::info(format!("container {container_id} stopped"))],
                    error: None,
                },
                Some(Err(e)) => StatusResult {
                    completed: true,
                    messages: Vec::new(),
                    error: Some(ActionError::errored(format!(
                        "failed to stop container {container_id}"
                    ))
                    .with_detail(e.clone())),
                },
            },
            ExecutionKind::Pause { container_id, pid } => {
                if ctx.target_alive(*pid) {
                    StatusResult::running()
                } else {
                    StatusResult {
                        completed: true,
                        messages: vec![Message::warn(format!(
                            "container {container_id} stopped while paused"
                        ))],
                        error: None,
                    }
                }
            }
        }
    }

    /// Releases everything the execution holds. Idempotent.
    pub async fn finish(&mut self, ctx: &ActionContext) -> Result<Vec<Message>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;
        let mut messages = Vec::new();

        match &mut self.kind {
            ExecutionKind::Sidecar(exec) => {
                if let Err(e) = ctx.sidecars.stop(&mut exec.sidecar).await {
                    warn!(execution_id = %self.id, "failed to stop sidecar {}: {}", exec.sidecar.id(), e);
                    messages.push(Message::warn(format!("failed to stop sidecar: {e}")));
                }
                if let Some(cleanup) = exec.cleanup.take()
                    && let Err(e) = ctx.sidecars.run_to_completion(&exec.opts, &cleanup, None).await
                {
                    warn!(execution_id = %self.id, "cleanup failed: {}", e);
                    return Err(e);
                }
            }
            ExecutionKind::Network(applied) => match ctx.network.revert(applied).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => messages.push(Message::info(e.to_string())),
                Err(e) => return Err(e),
            },
            ExecutionKind::StopContainer {
                container_id,
                task,
                outcome,
            } => {
                if outcome.borrow().is_none() {
                    task.abort();
                    info!(execution_id = %self.id, container = %container_id, "cancelled pending stop");
                    messages.push(Message::info(format!(
                        "stop of container {container_id} cancelled"
                    )));
                }
            }
            ExecutionKind::Pause { container_id, .. } => match ctx.client.unpause(container_id).await {
                Ok(()) => messages.push(Message::info(format!("container {container_id} unpaused"))),
                Err(e) if e.is_not_found() => {
                    messages.push(Message::info(format!("container {container_id} is gone")))
                }
                Err(e) => return Err(e),
            },
        }
        Ok(messages)
    }
}

/// Spawns the sidecar of an attack and builds its execution.
///
/// Waits briefly so that a sidecar failing right away fails the start
/// instead of the first status call.
pub async fn launch_sidecar(
    ctx: &ActionContext,
    opts: SidecarOpts,
    spec: &SidecarSpec,
    policy: ExitPolicy,
    cleanup: Option<SidecarSpec>,
) -> Result<Execution> {
    let mut sidecar = ctx.sidecars.spawn(&opts, spec).await?;
    let early = sidecar.wait_timeout(SIDECAR_EARLY_EXIT_WAIT).await;
    let exec = SidecarExecution {
        sidecar,
        opts,
        policy,
        cleanup,
    };
    let mut execution = Execution::new(exec.opts.execution_id, ExecutionKind::Sidecar(Box::new(exec)));

    if let Some(exit) = early
        && let ExecutionKind::Sidecar(exec) = &mut execution.kind
        && exit.exit_code != 0
        && classify_exit(exec, &exit, ctx.target_alive(exec.opts.target.pid))
            .error
            .is_some()
    {
        let e = Error::SidecarExitUnexpected {
            id: exec.sidecar.id().to_string(),
            exit_code: exit.exit_code,
            stderr: exit.stderr.clone(),
        };
        if let Err(stop) = ctx.sidecars.stop(&mut exec.sidecar).await {
            warn!(sidecar = %exec.sidecar.id(), "failed to release sidecar: {}", stop);
        }
        return Err(e);
    }
    Ok(execution)
}

fn classify_exit(exec: &SidecarExecution, exit: &ProcessExit, target_alive: bool) -> StatusResult {
    let id = exec.sidecar.id().to_string();
    let policy = &exec.policy;
    if exit.exit_code == 0 {
        return if policy.completes_on_exit {
            StatusResult::completed()
        } else {
            StatusResult::running()
        };
    }
    if policy.ignore_exit_codes.contains(&exit.exit_code) {
        let e = Error::SidecarExitIgnored {
            id,
            exit_code: exit.exit_code,
        };
        return StatusResult {
            completed: true,
            messages: vec![Message::warn(e.to_string())],
            error: None,
        };
    }
    if exit.exit_code == EXIT_CODE_SIGNALED && !target_alive {
        return StatusResult {
            completed: true,
            messages: vec![Message::warn(format!(
                "target container stopped, sidecar {id} was terminated"
            ))],
            error: None,
        };
    }
    if let Some(tolerated) = &policy.tolerated_stderr
        && exit.stderr.contains(tolerated.as_str())
    {
        return StatusResult::running();
    }
    let e = Error::SidecarExitUnexpected {
        id,
        exit_code: exit.exit_code,
        stderr: exit.stderr.clone(),
    };
    StatusResult {
        completed: true,
        messages: Vec::new(),
        error: Some(ActionError::from(&e)),
    }
}
