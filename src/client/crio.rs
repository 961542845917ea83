//! CRI-O adapter driving `crictl --runtime-endpoint unix://<socket>`.

use super::{ContainerInfo, ContainerRuntimeClient, RuntimeKind, run_cli};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Grace period passed to `crictl stop` for graceful stops.
const STOP_TIMEOUT_SECS: u32 = 30;

const STATE_RUNNING: &str = "CONTAINER_RUNNING";

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ImageSpec {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct CriContainer {
    id: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    image: ImageSpec,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    state: String,
}

impl From<CriContainer> for ContainerInfo {
    fn from(c: CriContainer) -> Self {
        Self {
            id: c.id,
            name: c.metadata.name,
            image: c.image.image,
            labels: c.labels,
            running: c.state == STATE_RUNNING,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PsOutput {
    #[serde(default)]
    containers: Vec<CriContainer>,
}

#[derive(Debug, Deserialize)]
struct InspectOutput {
    status: CriContainer,
    #[serde(default)]
    info: InspectInfo,
}

#[derive(Debug, Default, Deserialize)]
struct InspectInfo {
    #[serde(default)]
    pid: u32,
}

/// Client for CRI-O.
pub struct CrioClient {
    socket: PathBuf,
}

impl CrioClient {
    /// Creates a client for the CRI endpoint at `socket`.
    pub fn new(socket: &Path) -> Self {
        Self {
            socket: socket.to_path_buf(),
        }
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec![
            "--runtime-endpoint".to_string(),
            format!("unix://{}", self.socket.display()),
        ];
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn inspect(&self, id: &str) -> Result<InspectOutput> {
        let out = run_cli("crictl", &self.args(["inspect", "-o", "json", id]), Some(id)).await?;
        Ok(serde_json::from_slice(&out)?)
    }
}

#[async_trait]
impl ContainerRuntimeClient for CrioClient {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::CriO
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let out = run_cli(
            "crictl",
            &self.args(["ps", "--state", "running", "-o", "json"]),
            None,
        )
        .await?;
        let ps: PsOutput = serde_json::from_slice(&out)?;
        Ok(ps.containers.into_iter().map(ContainerInfo::from).collect())
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        Ok(self.inspect(id).await?.status.into())
    }

    async fn get_pid(&self, id: &str) -> Result<u32> {
        let inspect = self.inspect(id).await?;
        if inspect.info.pid == 0 {
            return Err(Error::TargetNotFound(format!("{id} (not running)")));
        }
        Ok(inspect.info.pid)
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        let timeout = if graceful { STOP_TIMEOUT_SECS } else { 0 };
        run_cli(
            "crictl",
            &self.args(["stop".to_string(), "--timeout".to_string(), timeout.to_string(), id.to_string()]),
            Some(id),
        )
        .await?;
        Ok(())
    }

    async fn pause(&self, _id: &str) -> Result<()> {
        Err(Error::Unsupported("pause is not supported by cri-o".to_string()))
    }

    async fn unpause(&self, _id: &str) -> Result<()> {
        Err(Error::Unsupported("unpause is not supported by cri-o".to_string()))
    }

    async fn version(&self) -> Result<String> {
        let out = run_cli("crictl", &self.args(["version"]), None).await?;
        String::from_utf8_lossy(&out)
            .lines()
            .find_map(|l| l.trim().strip_prefix("RuntimeVersion:").map(|v| v.trim().to_string()))
            .ok_or_else(|| Error::RuntimeIo {
                command: "crictl version".to_string(),
                stderr: "no runtime version in output".to_string(),
            })
    }
}
