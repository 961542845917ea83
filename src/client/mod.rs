//! Container runtime clients.
//!
//! The engine only needs a handful of operations from the runtime that owns
//! the target containers. They are captured by [`ContainerRuntimeClient`];
//! the Docker, containerd and CRI-O adapters drive the runtime's own CLI
//! against the configured socket.
//!
//! | Runtime    | CLI      | pause/unpause |
//! |------------|----------|---------------|
//! | Docker     | `docker` | yes           |
//! | containerd | `ctr`    | yes           |
//! | CRI-O      | `crictl` | unsupported   |

pub mod containerd;
pub mod crio;
pub mod docker;

pub use self::containerd::ContainerdClient;
pub use self::crio::CrioClient;
pub use self::docker::DockerClient;

use crate::config::Config;
use crate::constants::{
    CONTAINERD_RUNC_ROOT, CONTAINERD_SOCKET, CRIO_RUNC_ROOT, CRIO_SOCKET, DOCKER_RUNC_ROOT,
    DOCKER_SOCKET, STDERR_TAIL_LEN,
};
use crate::error::{Error, Result, stderr_tail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Runtime Kind
// =============================================================================

/// Supported container runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[serde(rename = "docker")]
    Docker,
    #[serde(rename = "containerd")]
    Containerd,
    #[serde(rename = "cri-o")]
    CriO,
}

impl RuntimeKind {
    /// Returns the runtime name as used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "containerd",
            Self::CriO => "cri-o",
        }
    }

    /// Returns the prefix used for runtime-qualified container ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Docker => "docker://",
            Self::Containerd => "containerd://",
            Self::CriO => "cri-o://",
        }
    }

    /// Returns the default socket of the runtime.
    pub fn default_socket(&self) -> &'static str {
        match self {
            Self::Docker => DOCKER_SOCKET,
            Self::Containerd => CONTAINERD_SOCKET,
            Self::CriO => CRIO_SOCKET,
        }
    }

    /// Returns the runc state root the runtime uses.
    pub fn default_runc_root(&self) -> &'static str {
        match self {
            Self::Docker => DOCKER_RUNC_ROOT,
            Self::Containerd => CONTAINERD_RUNC_ROOT,
            Self::CriO => CRIO_RUNC_ROOT,
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "containerd" => Ok(Self::Containerd),
            "cri-o" | "crio" => Ok(Self::CriO),
            other => Err(Error::InvalidConfig(format!(
                "unknown container runtime '{other}', expected docker, containerd or cri-o"
            ))),
        }
    }
}

/// Removes a runtime prefix (`docker://`, `containerd://`, `cri-o://`) from
/// a container id.
pub fn strip_runtime_prefix(id: &str) -> &str {
    id.split_once("://").map(|(_, rest)| rest).unwrap_or(id)
}

// =============================================================================
// Container Info
// =============================================================================

/// What the runtime reports about a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Bare container id (no runtime prefix).
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image reference the container was started from.
    pub image: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Whether the container is running.
    pub running: bool,
}

// =============================================================================
// Client Trait
// =============================================================================

/// The operations the engine consumes from a container runtime.
#[async_trait]
pub trait ContainerRuntimeClient: Send + Sync {
    /// Returns which runtime this client talks to.
    fn runtime(&self) -> RuntimeKind;

    /// Returns the socket the client is connected to.
    fn socket(&self) -> &Path;

    /// Lists running containers.
    async fn list(&self) -> Result<Vec<ContainerInfo>>;

    /// Returns details for one container.
    async fn info(&self, id: &str) -> Result<ContainerInfo>;

    /// Returns the host PID of the container's init process.
    async fn get_pid(&self, id: &str) -> Result<u32>;

    /// Stops a container, gracefully (SIGTERM with grace period) or not.
    async fn stop(&self, id: &str, graceful: bool) -> Result<()>;

    /// Freezes all processes of a container.
    async fn pause(&self, id: &str) -> Result<()>;

    /// Thaws a paused container.
    async fn unpause(&self, id: &str) -> Result<()>;

    /// Returns the runtime version.
    async fn version(&self) -> Result<String>;
}

/// Creates the client for the configured runtime.
pub fn new_client(config: &Config) -> Arc<dyn ContainerRuntimeClient> {
    match config.container_runtime {
        RuntimeKind::Docker => Arc::new(DockerClient::new(&config.container_socket)),
        RuntimeKind::Containerd => Arc::new(ContainerdClient::new(
            &config.container_socket,
            &config.containerd_namespace,
        )),
        RuntimeKind::CriO => Arc::new(CrioClient::new(&config.container_socket)),
    }
}

// =============================================================================
// CLI Helper
// =============================================================================

/// Runs a runtime CLI and returns its stdout.
///
/// Stderr mentioning a missing container maps to [`Error::TargetNotFound`]
/// for `id`. The child is killed if the returned future is dropped.
pub(crate) async fn run_cli(program: &str, args: &[String], id: Option<&str>) -> Result<Vec<u8>> {
    debug!("running {} {}", program, args.join(" "));
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::RuntimeIo {
            command: program.to_string(),
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = stderr_tail(&output.stderr, STDERR_TAIL_LEN);
    if let Some(id) = id
        && is_not_found_message(&stderr)
    {
        return Err(Error::TargetNotFound(id.to_string()));
    }
    Err(Error::RuntimeIo {
        command: format!("{} {}", program, args.first().cloned().unwrap_or_default()),
        stderr,
    })
}

fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("not found")
        || lower.contains("does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("CRI-O".parse::<RuntimeKind>().unwrap(), RuntimeKind::CriO);
        assert_eq!("crio".parse::<RuntimeKind>().unwrap(), RuntimeKind::CriO);
        assert!("podman".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_strip_runtime_prefix() {
        assert_eq!(strip_runtime_prefix("containerd://abc"), "abc");
        assert_eq!(strip_runtime_prefix("cri-o://abc"), "abc");
        assert_eq!(strip_runtime_prefix("abc"), "abc");
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found_message("Error: No such container: abc"));
        assert!(is_not_found_message("container \"abc\" in namespace \"k8s.io\": not found"));
        assert!(!is_not_found_message("permission denied"));
    }
}
