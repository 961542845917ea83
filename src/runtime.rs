//! OCI runner trait for sidecar containers.
//!
//! The engine drives a low-level OCI runtime (`runc`-class) through the
//! operations below. Sidecars are either run to completion with captured
//! output or spawned in the background with their exit delivered through a
//! [`tokio::sync::watch`] channel.
//!
//! ```text
//! run(id, bundle, stdin) ───────────────────────────────► RunOutput
//!
//! spawn(id, bundle) ─► RunningProcess ─► kill(id, SIGINT) ─► ... ─► delete(id, force)
//!                           │
//!                           └── watch: None ──► Some(ProcessExit)
//! ```

use crate::constants::{EXIT_CODE_SIGNALED, OCI_RUNTIME_SPEC_VERSION};
use crate::error::{Result, stderr_tail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Container State
// =============================================================================

/// OCI container status as reported by `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// OCI container state (`runc state` output).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    /// Creates a state record.
    pub fn new(id: impl Into<String>, bundle: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            id: id.into(),
            status,
            pid: None,
            bundle: bundle.into(),
            created: None,
            annotations: HashMap::new(),
        }
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signals sent to sidecars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, the first step of the stop sequence.
    Int,
    /// SIGTERM.
    Term,
    /// SIGKILL.
    Kill,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Int => libc::SIGINT,
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    /// Returns the name passed to `runc kill`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "SIGINT",
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

impl std::str::FromStr for Signal {
    type Err = crate::error::Error;

    /// Parses `SIGTERM`, `TERM` or `15`.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" | "2" => Ok(Self::Int),
            "TERM" | "15" => Ok(Self::Term),
            "KILL" | "9" => Ok(Self::Kill),
            _ => Err(crate::error::Error::InvalidConfig(format!("unknown signal '{s}'"))),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Process Results
// =============================================================================

/// Output of a sidecar run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, [`EXIT_CODE_SIGNALED`] if terminated by a signal.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    /// Returns true if the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout as text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Returns at most `max` trailing bytes of stderr.
    pub fn stderr_tail(&self, max: usize) -> String {
        stderr_tail(&self.stderr, max)
    }
}

/// How a spawned sidecar ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, [`EXIT_CODE_SIGNALED`] if terminated by a signal.
    pub exit_code: i32,
    /// Tail of the captured stderr.
    pub stderr: String,
}

impl ProcessExit {
    /// Converts a std exit status into an exit code.
    pub fn code_of(status: std::process::ExitStatus) -> i32 {
        status.code().unwrap_or(EXIT_CODE_SIGNALED)
    }
}

/// Handle on a sidecar started with [`OciRunner::spawn`].
#[derive(Debug, Clone)]
pub struct RunningProcess {
    id: String,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl RunningProcess {
    /// Wraps the receiving side of an exit channel.
    pub fn new(id: impl Into<String>, exit: watch::Receiver<Option<ProcessExit>>) -> Self {
        Self {
            id: id.into(),
            exit,
        }
    }

    /// Sidecar id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the exit if the process has ended. Never blocks.
    pub fn exited(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    /// Waits until the process ends.
    ///
    /// Returns `None` if the sender went away without reporting an exit.
    pub async fn wait(&mut self) -> Option<ProcessExit> {
        let waited = self.exit.wait_for(Option::is_some).await.map(|exit| exit.clone());
        match waited {
            Ok(exit) => exit,
            Err(_) => self.exit.borrow().clone(),
        }
    }

    /// Waits at most `timeout` for the process to end.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.wait()).await.ok().flatten()
    }
}

// =============================================================================
// OCI Runner Trait
// =============================================================================

/// Low-level OCI runtime operations used for sidecars.
///
/// Operations on an unknown container fail with
/// [`Error::TargetNotFound`](crate::error::Error::TargetNotFound) so callers
/// can treat "does not exist" as success during teardown.
#[async_trait]
pub trait OciRunner: Send + Sync {
    /// Runtime name (e.g. `runc`).
    fn name(&self) -> &str;

    /// Creates a container from a bundle without starting it.
    async fn create(&self, id: &str, bundle: &Path) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Runs a container to completion, feeding `stdin` if given.
    async fn run(&self, id: &str, bundle: &Path, stdin: Option<Vec<u8>>) -> Result<RunOutput>;

    /// Runs a container in the background.
    async fn spawn(&self, id: &str, bundle: &Path) -> Result<RunningProcess>;

    /// Returns the container state.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Sends a signal to the container's processes.
    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()>;

    /// Deletes the container.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;
}
