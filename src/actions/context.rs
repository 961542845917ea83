//! Shared services of all actions and the execution lifecycle.

use super::execution::Execution;
use super::{StartResult, StatusResult, StopResult};
use crate::bundle::BundleBuilder;
use crate::cgroup::CgroupReader;
use crate::client::ContainerRuntimeClient;
use crate::config::Config;
use crate::constants::{CGROUP_ROOT, PROC_ROOT};
use crate::error::{Error, Result};
use crate::network::{HostnameResolver, NetworkManager, agent_ips};
use crate::registry::ExecutionRegistry;
use crate::runtime::OciRunner;
use crate::sidecar::Sidecars;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything an action needs besides its own state.
pub struct ActionContext {
    pub config: Config,
    pub client: Arc<dyn ContainerRuntimeClient>,
    pub sidecars: Sidecars,
    pub network: NetworkManager,
    pub resolver: HostnameResolver,
    pub cgroups: CgroupReader,
    pub proc_root: PathBuf,
    /// Host addresses excluded from network attacks.
    pub agent_ips: Vec<IpAddr>,
    pub registry: ExecutionRegistry<Execution>,
}

impl ActionContext {
    /// Creates the context for the real host.
    pub fn new(
        config: Config,
        client: Arc<dyn ContainerRuntimeClient>,
        runner: Arc<dyn OciRunner>,
    ) -> Self {
        let ips = agent_ips();
        Self::with_roots(config, client, runner, Path::new(PROC_ROOT), Path::new(CGROUP_ROOT), ips)
    }

    /// Creates a context reading procfs and cgroupfs below the given roots.
    pub fn with_roots(
        config: Config,
        client: Arc<dyn ContainerRuntimeClient>,
        runner: Arc<dyn OciRunner>,
        proc_root: &Path,
        cgroup_root: &Path,
        agent_ips: Vec<IpAddr>,
    ) -> Self {
        let builder = BundleBuilder::new(&config.workdir, &config.sidecar_image_path)
            .with_proc_root(proc_root);
        let sidecars = Sidecars::new(builder, runner, config.runc.systemd_cgroup);
        Self {
            network: NetworkManager::new(sidecars.clone()),
            resolver: HostnameResolver::new(sidecars.clone()),
            sidecars,
            cgroups: CgroupReader::new(cgroup_root),
            proc_root: proc_root.to_path_buf(),
            agent_ips,
            registry: ExecutionRegistry::new(),
            config,
            client,
        }
    }

    /// Returns true while the process exists below the proc root.
    pub fn target_alive(&self, pid: u32) -> bool {
        self.proc_root.join(pid.to_string()).exists()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs `launch` and registers the resulting execution.
    ///
    /// `launch` always runs to completion, so everything it applied is
    /// recorded in the execution. A stop arriving meanwhile only marks the
    /// start as cancelled; the execution is then finished right away.
    pub async fn start_execution<F>(&self, execution_id: Uuid, launch: F) -> Result<StartResult>
    where
        F: Future<Output = Result<(Execution, StartResult)>> + Send,
    {
        if self.registry.contains(&execution_id) {
            return Err(Error::Internal(format!(
                "execution {execution_id} is already running"
            )));
        }
        let ticket = self.registry.begin_start(execution_id)?;

        let (execution, result) = match launch.await {
            Ok(launched) => launched,
            Err(e) => {
                warn!(execution_id = %execution_id, "start failed: {}", e);
                return Err(e);
            }
        };

        let entry = self.registry.insert(execution_id, execution)?;
        if ticket.is_cancelled() {
            warn!(execution_id = %execution_id, "start cancelled by stop");
            self.registry.remove(&execution_id)?;
            if let Err(e) = entry.lock().await.finish(self).await {
                warn!(execution_id = %execution_id, "failed to release cancelled execution: {}", e);
            }
            return Err(Error::Cancelled(execution_id));
        }
        drop(ticket);
        info!(execution_id = %execution_id, "execution started");
        Ok(result)
    }

    /// Status of a registered execution; unknown ids report completed.
    pub async fn execution_status(&self, execution_id: Uuid) -> Result<StatusResult> {
        let Some(entry) = self.registry.get(&execution_id)? else {
            return Ok(StatusResult::completed());
        };
        let mut execution = entry.lock().await;
        let mut status = execution.poll(self);
        if status.completed && !execution.is_finished() {
            info!(execution_id = %execution_id, "execution completed");
            match execution.finish(self).await {
                Ok(messages) => status.messages.extend(messages),
                Err(e) => {
                    warn!(execution_id = %execution_id, "failed to release execution: {}", e);
                    status.messages.push(super::Message::warn(e.to_string()));
                }
            }
            drop(execution);
            self.registry.remove(&execution_id)?;
        }
        Ok(status)
    }

    /// Stops an execution. Unknown ids are a no-op.
    pub async fn stop_execution(&self, execution_id: Uuid) -> Result<StopResult> {
        if self.registry.cancel_pending(&execution_id)? {
            info!(execution_id = %execution_id, "cancelling pending start");
        }
        let Some(entry) = self.registry.remove(&execution_id)? else {
            return Ok(StopResult::default());
        };
        let mut execution = entry.lock().await;
        let messages = execution.finish(self).await?;
        info!(execution_id = %execution_id, "execution stopped");
        Ok(StopResult {
            messages,
            error: None,
        })
    }

    /// Stops every registered execution.
    pub async fn shutdown(&self) -> Result<()> {
        let entries = self.registry.drain()?;
        if !entries.is_empty() {
            info!("stopping {} running executions", entries.len());
        }
        for (id, entry) in entries {
            if let Err(e) = entry.lock().await.finish(self).await {
                warn!(execution_id = %id, "failed to stop execution: {}", e);
            }
        }
        Ok(())
    }
}
