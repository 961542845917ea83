//! Applies and reverts network faults inside a target's network namespace.
//!
//! A compiled fault is a list of [`Batch`]es, each piped into one `network`
//! sidecar (`ip -4 -force -batch -`, `ip -6 -force -batch -` or
//! `tc -force -batch -`). The inverse batches are recorded at apply time and
//! replayed on revert.
//!
//! Only one network fault may be active per network namespace. The manager
//! tracks holders by namespace inode; a [`NetNsGuard`] releases its entry
//! when dropped.

use super::ip::ip_rule_commands;
use super::tc::tc_commands;
use super::{Family, Mode, NetworkOpts};
use crate::error::{Error, Result};
use crate::introspect::{Namespace, NamespaceKind};
use crate::sidecar::{SidecarOpts, SidecarSpec, Sidecars};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Batches
// =============================================================================

/// The tool a batch is piped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Ip(Family),
    Tc,
}

impl Tool {
    /// Command line reading the batch from stdin.
    pub fn args(&self) -> Vec<String> {
        let args: Vec<&str> = match self {
            Self::Ip(family) => vec!["ip", family.ip_flag(), "-force", "-batch", "-"],
            Self::Tc => vec!["tc", "-force", "-batch", "-"],
        };
        args.into_iter().map(String::from).collect()
    }
}

/// Commands executed by one sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub tool: Tool,
    pub commands: Vec<String>,
}

impl Batch {
    /// Stdin of the sidecar.
    pub fn script(&self) -> String {
        let mut script = self.commands.join("\n");
        script.push('\n');
        script
    }
}

/// Compiles `opts` into batches. Delete batches come in reverse order.
pub fn compile(opts: &NetworkOpts, mode: Mode) -> Result<Vec<Batch>> {
    let mut batches = Vec::new();
    if opts.uses_ip_rules() {
        for family in [Family::V4, Family::V6] {
            let commands = ip_rule_commands(opts, family, mode);
            if !commands.is_empty() {
                batches.push(Batch {
                    tool: Tool::Ip(family),
                    commands,
                });
            }
        }
    } else {
        batches.push(Batch {
            tool: Tool::Tc,
            commands: tc_commands(opts, mode, opts.interfaces())?,
        });
    }
    if mode == Mode::Delete {
        batches.reverse();
    }
    Ok(batches)
}

// =============================================================================
// Namespace Guard
// =============================================================================

type Holders = Arc<Mutex<HashMap<u64, Uuid>>>;

/// Exclusive claim on a network namespace, released on drop.
#[derive(Debug)]
pub struct NetNsGuard {
    inode: u64,
    execution_id: Uuid,
    holders: Holders,
}

impl NetNsGuard {
    pub fn inode(&self) -> u64 {
        self.inode
    }
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if let Ok(mut holders) = self.holders.lock()
            && holders.get(&self.inode) == Some(&self.execution_id)
        {
            holders.remove(&self.inode);
        }
    }
}

// =============================================================================
// Applied Fault
// =============================================================================

/// A fault active in a target namespace.
#[derive(Debug)]
pub struct AppliedNetwork {
    opts: SidecarOpts,
    network: NetworkOpts,
    net_ns: Namespace,
    revert: Vec<Batch>,
    guard: Option<NetNsGuard>,
}

impl AppliedNetwork {
    pub fn network(&self) -> &NetworkOpts {
        &self.network
    }

    /// Batches replayed on revert.
    pub fn revert_batches(&self) -> &[Batch] {
        &self.revert
    }

    pub fn is_reverted(&self) -> bool {
        self.guard.is_none()
    }
}

/// A network interface as reported by `ip -json link show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(rename = "ifname")]
    pub name: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub link_type: String,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.flags.iter().any(|f| f == "UP")
    }

    pub fn is_loopback(&self) -> bool {
        self.link_type == "loopback" || self.flags.iter().any(|f| f == "LOOPBACK")
    }
}

/// Parses `ip -json link show` output.
pub fn parse_interfaces(json: &str) -> Result<Vec<Interface>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| Error::Serialization(format!("failed to parse ip link output: {e}")))
}

// =============================================================================
// Manager
// =============================================================================

/// Runs network batches in sidecars and guards namespaces.
#[derive(Clone)]
pub struct NetworkManager {
    sidecars: Sidecars,
    holders: Holders,
}

impl NetworkManager {
    pub fn new(sidecars: Sidecars) -> Self {
        Self {
            sidecars,
            holders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn holders(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, Uuid>>> {
        self.holders
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Fails with [`Error::AlreadyAttacked`] if the namespace is claimed.
    pub fn check_available(&self, inode: u64) -> Result<()> {
        if self.holders()?.contains_key(&inode) {
            return Err(Error::AlreadyAttacked { inode });
        }
        Ok(())
    }

    /// Claims the namespace with the given inode for `execution_id`.
    pub fn acquire(&self, inode: u64, execution_id: Uuid) -> Result<NetNsGuard> {
        let mut holders = self.holders()?;
        if holders.contains_key(&inode) {
            return Err(Error::AlreadyAttacked { inode });
        }
        holders.insert(inode, execution_id);
        Ok(NetNsGuard {
            inode,
            execution_id,
            holders: Arc::clone(&self.holders),
        })
    }

    /// Inodes of the namespaces currently under attack.
    pub fn active_namespaces(&self) -> Result<Vec<u64>> {
        Ok(self.holders()?.keys().copied().collect())
    }

    /// Applies `network` in the target's network namespace.
    ///
    /// On failure the batches applied so far are rolled back and the
    /// namespace is released.
    pub async fn apply(&self, opts: &SidecarOpts, network: &NetworkOpts) -> Result<AppliedNetwork> {
        let net_ns = opts.target.require_namespace(NamespaceKind::Net)?.clone();
        let guard = self.acquire(net_ns.inode, opts.execution_id)?;

        let add = compile(network, Mode::Add)?;
        let revert = compile(network, Mode::Delete)?;
        info!(execution_id = %opts.execution_id, net_ns = net_ns.inode, "applying {}", network);

        for (i, batch) in add.iter().enumerate() {
            if let Err(e) = self.run_batch(opts, batch).await {
                warn!(execution_id = %opts.execution_id, "failed to apply {}: {}", network, e);
                for undo in &revert[revert.len() - 1 - i..] {
                    if let Err(undo_err) = self.run_batch(opts, undo).await {
                        warn!(execution_id = %opts.execution_id, "rollback failed: {}", undo_err);
                    }
                }
                return Err(e);
            }
        }

        Ok(AppliedNetwork {
            opts: opts.clone(),
            network: network.clone(),
            net_ns,
            revert,
            guard: Some(guard),
        })
    }

    /// Reverts an applied fault. A second call is a no-op.
    ///
    /// Returns [`Error::RevertSkipped`] if the namespace no longer exists.
    pub async fn revert(&self, applied: &mut AppliedNetwork) -> Result<()> {
        let Some(guard) = applied.guard.take() else {
            return Ok(());
        };
        let execution_id = applied.opts.execution_id;

        if !applied.net_ns.is_current() {
            drop(guard);
            info!(execution_id = %execution_id, "network namespace {} is gone, nothing to revert", applied.net_ns.inode);
            return Err(Error::RevertSkipped(format!(
                "network namespace {} of the target no longer exists",
                applied.net_ns.inode
            )));
        }

        info!(execution_id = %execution_id, "reverting {}", applied.network);
        let mut first_error = None;
        for batch in &applied.revert {
            if let Err(e) = self.run_batch(&applied.opts, batch).await {
                warn!(execution_id = %execution_id, "failed to revert {}: {}", applied.network, e);
                first_error.get_or_insert(e);
            }
        }
        drop(guard);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Up, non-loopback interfaces of the target.
    pub async fn list_interfaces(&self, opts: &SidecarOpts) -> Result<Vec<Interface>> {
        let spec = SidecarSpec::new("network", ["ip", "-json", "link", "show"])
            .with_namespaces(&[NamespaceKind::Net])
            .in_cgroup("network");
        let output = self.sidecars.run_to_completion(opts, &spec, None).await?;
        let interfaces = parse_interfaces(&output.stdout_text())?;
        Ok(interfaces
            .into_iter()
            .filter(|i| i.is_up() && !i.is_loopback())
            .collect())
    }

    async fn run_batch(&self, opts: &SidecarOpts, batch: &Batch) -> Result<()> {
        if batch.commands.is_empty() {
            return Ok(());
        }
        debug!(execution_id = %opts.execution_id, "{}:\n{}", batch.tool.args().join(" "), batch.script());
        let spec = SidecarSpec::new("network", batch.tool.args())
            .with_namespaces(&[NamespaceKind::Net])
            .in_cgroup("network")
            .with_capabilities(&["CAP_NET_ADMIN"]);
        self.sidecars
            .run_to_completion(opts, &spec, Some(batch.script().into_bytes()))
            .await?;
        Ok(())
    }
}
