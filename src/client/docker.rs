//! Docker adapter driving `docker -H unix://<socket>`.

use super::{ContainerInfo, ContainerRuntimeClient, RuntimeKind, run_cli};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Subset of `docker inspect` output the agent reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    #[serde(default)]
    name: String,
    config: InspectConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    pid: u32,
}

impl From<Inspect> for ContainerInfo {
    fn from(i: Inspect) -> Self {
        Self {
            id: i.id,
            name: i.name.trim_start_matches('/').to_string(),
            image: i.config.image,
            labels: i.config.labels.unwrap_or_default(),
            running: i.state.running,
        }
    }
}

/// Client for the Docker engine.
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    /// Creates a client for the engine listening on `socket`.
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
            "-H".to_string(),
            format!("unix://{}", self.socket.display()),
        ];
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn inspect(&self, ids: &[String]) -> Result<Vec<Inspect>> {
        let mut rest = vec!["inspect".to_string()];
        rest.extend(ids.iter().cloned());
        let id = if ids.len() == 1 { Some(ids[0].as_str()) } else { None };
        let out = run_cli("docker", &self.args(rest), id).await?;
        Ok(serde_json::from_slice(&out)?)
    }
}

#[async_trait]
impl ContainerRuntimeClient for DockerClient {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let out = run_cli("docker", &self.args(["ps", "-q", "--no-trunc"]), None).await?;
        let ids: Vec<String> = String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .inspect(&ids)
            .await?
            .into_iter()
            .map(ContainerInfo::from)
            .filter(|c| c.running)
            .collect())
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        self.inspect(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .map(ContainerInfo::from)
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))
    }

    async fn get_pid(&self, id: &str) -> Result<u32> {
        let inspect = self
            .inspect(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;
        if !inspect.state.running || inspect.state.pid == 0 {
            return Err(Error::TargetNotFound(format!("{id} (not running)")));
        }
        Ok(inspect.state.pid)
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        let verb = if graceful { "stop" } else { "kill" };
        run_cli("docker", &self.args([verb, id]), Some(id)).await?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        run_cli("docker", &self.args(["pause", id]), Some(id)).await?;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        run_cli("docker", &self.args(["unpause", id]), Some(id)).await?;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let out = run_cli(
            "docker",
            &self.args(["version", "--format", "{{.Server.Version}}"]),
            None,
        )
        .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}
