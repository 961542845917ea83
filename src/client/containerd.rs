//! containerd adapter driving `ctr --address <socket> --namespace <ns>`.

use super::{ContainerInfo, ContainerRuntimeClient, RuntimeKind, run_cli};
use crate::constants::LABEL_K8S_CONTAINER_NAME;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Time a gracefully stopped task gets before SIGKILL.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Interval between task status polls while stopping.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerRecord {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// A row of `ctr task ls`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskRow {
    id: String,
    pid: u32,
    status: String,
}

fn parse_task_list(output: &str) -> Vec<TaskRow> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let id = cols.next()?.to_string();
            let pid = cols.next()?.parse().ok()?;
            let status = cols.next()?.to_string();
            Some(TaskRow { id, pid, status })
        })
        .collect()
}

/// Client for containerd.
pub struct ContainerdClient {
    socket: PathBuf,
    namespace: String,
}

impl ContainerdClient {
    /// Creates a client for `socket`, scoped to `namespace`.
    pub fn new(socket: &Path, namespace: &str) -> Self {
        Self {
            socket: socket.to_path_buf(),
            namespace: namespace.to_string(),
        }
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec![
            "--address".to_string(),
            self.socket.display().to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn tasks(&self) -> Result<Vec<TaskRow>> {
        let out = run_cli("ctr", &self.args(["task", "ls"]), None).await?;
        Ok(parse_task_list(&String::from_utf8_lossy(&out)))
    }

    async fn task(&self, id: &str) -> Result<Option<TaskRow>> {
        Ok(self.tasks().await?.into_iter().find(|t| t.id == id))
    }

    async fn record(&self, id: &str) -> Result<ContainerRecord> {
        let out = run_cli("ctr", &self.args(["containers", "info", id]), Some(id)).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    fn to_info(record: ContainerRecord, running: bool) -> ContainerInfo {
        let labels = record.labels.unwrap_or_default();
        let name = labels
            .get(LABEL_K8S_CONTAINER_NAME)
            .cloned()
            .unwrap_or_else(|| record.id.clone());
        ContainerInfo {
            id: record.id,
            name,
            image: record.image,
            labels,
            running,
        }
    }

    async fn kill(&self, id: &str, signal: &str) -> Result<()> {
        run_cli(
            "ctr",
            &self.args(["task", "kill", "--all", "--signal", signal, id]),
            Some(id),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntimeClient for ContainerdClient {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Containerd
    }

    fn socket(&self) -> &Path {
        &self.socket
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut containers = Vec::new();
        for task in self.tasks().await? {
            if task.status != "RUNNING" {
                continue;
            }
            match self.record(&task.id).await {
                Ok(record) => containers.push(Self::to_info(record, true)),
                Err(Error::TargetNotFound(_)) => debug!("container {} vanished while listing", task.id),
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        let record = self.record(id).await?;
        let running = self
            .task(id)
            .await?
            .is_some_and(|t| t.status == "RUNNING");
        Ok(Self::to_info(record, running))
    }

    async fn get_pid(&self, id: &str) -> Result<u32> {
        match self.task(id).await? {
            Some(task) if task.pid > 0 => Ok(task.pid),
            _ => Err(Error::TargetNotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        if graceful {
            self.kill(id, "SIGTERM").await?;
            let deadline = tokio::time::Instant::now() + STOP_GRACE_PERIOD;
            while tokio::time::Instant::now() < deadline {
                match self.task(id).await? {
                    Some(task) if task.status == "RUNNING" => {
                        tokio::time::sleep(STOP_POLL_INTERVAL).await
                    }
                    _ => return Ok(()),
                }
            }
            warn!("container {} did not stop within {:?}, killing", id, STOP_GRACE_PERIOD);
        }
        self.kill(id, "SIGKILL").await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        run_cli("ctr", &self.args(["task", "pause", id]), Some(id)).await?;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        run_cli("ctr", &self.args(["task", "resume", id]), Some(id)).await?;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let out = run_cli("ctr", &self.args(["version"]), None).await?;
        let text = String::from_utf8_lossy(&out);
        let server = text.split("Server:").nth(1).unwrap_or(&text);
        server
            .lines()
            .find_map(|l| l.trim().strip_prefix("Version:").map(|v| v.trim().to_string()))
            .ok_or_else(|| Error::RuntimeIo {
                command: "ctr version".to_string(),
                stderr: "no server version in output".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_list() {
        let output = "TASK                 PID      STATUS\n\
                      abc123               4242     RUNNING\n\
                      def456               0        STOPPED\n";
        let rows = parse_task_list(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "abc123");
        assert_eq!(rows[0].pid, 4242);
        assert_eq!(rows[1].status, "STOPPED");
    }

    #[test]
    fn test_name_from_k8s_label() {
        let record: ContainerRecord = serde_json::from_str(
            r#"{"ID": "abc", "Image": "nginx", "Labels": {"io.kubernetes.container.name": "web"}}"#,
        )
        .unwrap();
        let info = ContainerdClient::to_info(record, true);
        assert_eq!(info.name, "web");
        assert!(info.running);
    }
}
