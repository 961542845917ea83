//! Sidecar lifecycle.
//!
//! A sidecar is a disposable container built from the agent's sidecar image
//! that joins selected namespaces and the cgroup of a target. This module
//! owns the whole life of one:
//!
//! ```text
//! create bundle ─► edit spec ─► mount from target ─► runc run ─► stop ─► delete ─► remove bundle
//!        │              │               │                │
//!        └──────────────┴───────────────┴────────────────┴── any failure: delete + remove bundle
//! ```
//!
//! One-shot sidecars (`ip`, `tc`, `dig`, `df`) are run to completion.
//! Long-running ones (`stress-ng`, `memfill`, `dd`) are spawned and later
//! stopped with the SIGINT → SIGTERM → SIGKILL sequence.

use crate::bundle::{Bundle, BundleBuilder, SpecEdit, cgroups_path};
use crate::constants::{
    ID_SUFFIX_LEN, ONE_SHOT_TIMEOUT, SIDECAR_ANNOTATION, SIDECAR_GRACE_PERIOD,
    SIDECAR_KILL_PERIOD, STDERR_TAIL_LEN,
};
use crate::error::{Error, Result};
use crate::introspect::{NamespaceKind, TargetProcess};
use crate::runtime::{OciRunner, ProcessExit, RunOutput, RunningProcess, Signal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Annotation carrying the execution id a sidecar belongs to.
pub const EXECUTION_ANNOTATION: &str = "com.steadybit.execution-id";

static SIDECAR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a fresh sidecar id `sb-<kind>-<counter>-<suffix>`.
pub fn sidecar_id(kind: &str, suffix: &str) -> String {
    let n = SIDECAR_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("sb-{kind}-{n}-{suffix}")
}

// =============================================================================
// Options
// =============================================================================

/// Target binding shared by all sidecars of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarOpts {
    pub target: TargetProcess,
    /// First characters of the target container id.
    pub id_suffix: String,
    pub execution_id: Uuid,
}

impl SidecarOpts {
    /// Binds sidecars to `target`, deriving the id suffix from `container_id`.
    pub fn new(target: TargetProcess, container_id: &str, execution_id: Uuid) -> Self {
        let bare = crate::client::strip_runtime_prefix(container_id);
        let id_suffix: String = bare
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(ID_SUFFIX_LEN)
            .collect();
        Self {
            target,
            id_suffix,
            execution_id,
        }
    }
}

/// A path of the target made visible inside the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMount {
    pub from: String,
    pub to: String,
    pub copy_fallback: bool,
}

/// What a sidecar runs and which parts of the target it shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarSpec {
    pub kind: String,
    pub args: Vec<String>,
    pub namespaces: Vec<NamespaceKind>,
    /// Child cgroup below the target's cgroup (`network`, `stress`, ...).
    pub cgroup_child: Option<String>,
    pub capabilities: Vec<String>,
    /// Paths bind-mounted from the target's filesystem.
    pub target_mounts: Vec<TargetMount>,
    /// Edits applied after the common ones.
    pub edits: Vec<SpecEdit>,
}

impl SidecarSpec {
    pub fn new<I, S>(kind: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            namespaces: Vec::new(),
            cgroup_child: None,
            capabilities: Vec::new(),
            target_mounts: Vec::new(),
            edits: Vec::new(),
        }
    }

    pub fn with_namespaces(mut self, kinds: &[NamespaceKind]) -> Self {
        self.namespaces = kinds.to_vec();
        self
    }

    pub fn in_cgroup(mut self, child: &str) -> Self {
        self.cgroup_child = Some(child.to_string());
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn mount_from_target(mut self, from: &str, to: &str) -> Self {
        self.target_mounts.push(TargetMount {
            from: from.to_string(),
            to: to.to_string(),
            copy_fallback: false,
        });
        self
    }

    /// Like [`Self::mount_from_target`], copying the file if mounting fails.
    pub fn mount_or_copy_from_target(mut self, from: &str, to: &str) -> Self {
        self.target_mounts.push(TargetMount {
            from: from.to_string(),
            to: to.to_string(),
            copy_fallback: true,
        });
        self
    }

    pub fn with_edit(mut self, edit: SpecEdit) -> Self {
        self.edits.push(edit);
        self
    }
}

// =============================================================================
// Running Sidecar
// =============================================================================

/// A spawned sidecar and the resources it holds.
#[derive(Debug)]
pub struct Sidecar {
    id: String,
    bundle: Option<Bundle>,
    process: RunningProcess,
}

impl Sidecar {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exit of the sidecar process, if it ended.
    pub fn exited(&self) -> Option<ProcessExit> {
        self.process.exited()
    }

    /// Waits at most `timeout` for the sidecar to exit.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ProcessExit> {
        self.process.wait_timeout(timeout).await
    }

    /// Returns true once [`Sidecars::stop`] released all resources.
    pub fn is_released(&self) -> bool {
        self.bundle.is_none()
    }
}

// =============================================================================
// Sidecar Service
// =============================================================================

/// Builds, runs and tears down sidecars.
#[derive(Clone)]
pub struct Sidecars {
    builder: BundleBuilder,
    runner: Arc<dyn OciRunner>,
    systemd_cgroup: bool,
}

impl Sidecars {
    pub fn new(builder: BundleBuilder, runner: Arc<dyn OciRunner>, systemd_cgroup: bool) -> Self {
        Self {
            builder,
            runner,
            systemd_cgroup,
        }
    }

    pub fn runner(&self) -> &Arc<dyn OciRunner> {
        &self.runner
    }

    pub fn workdir(&self) -> &Path {
        self.builder.workdir()
    }

    /// Creates and configures the bundle of a new sidecar.
    async fn prepare(&self, opts: &SidecarOpts, spec: &SidecarSpec) -> Result<Bundle> {
        let id = sidecar_id(&spec.kind, &opts.id_suffix);
        let builder = self.builder.clone();
        let create_id = id.clone();
        let mut bundle = tokio::task::spawn_blocking(move || builder.create(&create_id))
            .await
            .map_err(|e| Error::Internal(format!("bundle task failed: {e}")))??;

        match self.configure(&mut bundle, opts, spec) {
            Ok(()) => Ok(bundle),
            Err(e) => {
                if let Err(cleanup) = bundle.remove() {
                    warn!("failed to remove bundle of {}: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }

    fn configure(&self, bundle: &mut Bundle, opts: &SidecarOpts, spec: &SidecarSpec) -> Result<()> {
        let id = bundle.id().to_string();
        let namespaces = spec
            .namespaces
            .iter()
            .map(|kind| opts.target.require_namespace(*kind).cloned())
            .collect::<Result<Vec<_>>>()?;

        let mut edits = Vec::new();
        // A hostname would be written into a joined UTS namespace.
        if !spec.namespaces.contains(&NamespaceKind::Uts) {
            edits.push(SpecEdit::Hostname(id));
        }
        edits.extend([
            SpecEdit::Annotation(SIDECAR_ANNOTATION.to_string(), "true".to_string()),
            SpecEdit::Annotation(EXECUTION_ANNOTATION.to_string(), opts.execution_id.to_string()),
            SpecEdit::Args(spec.args.clone()),
            SpecEdit::Cwd("/tmp".to_string()),
            SpecEdit::ReadonlyRoot,
            SpecEdit::Namespaces {
                pid: opts.target.pid,
                namespaces,
            },
        ]);
        if let Some(child) = &spec.cgroup_child {
            edits.push(SpecEdit::CgroupsPath(cgroups_path(
                &opts.target.cgroup_path,
                child,
                self.systemd_cgroup,
            )));
        }
        if !spec.capabilities.is_empty() {
            edits.push(SpecEdit::Capabilities(spec.capabilities.clone()));
        }
        edits.push(SpecEdit::TmpfsTmp);
        edits.extend(spec.edits.iter().cloned());
        bundle.edit_spec(&edits)?;

        for mount in &spec.target_mounts {
            match bundle.mount_from_process(opts.target.pid, &mount.from, &mount.to) {
                Ok(()) => {}
                Err(e) if mount.copy_fallback => {
                    debug!("mounting {} failed ({}), copying instead", mount.from, e);
                    bundle.copy_file_from_process(opts.target.pid, &mount.from, &mount.to)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Runs a one-shot sidecar and returns its output.
    ///
    /// A non-zero exit is reported as [`Error::RuntimeIo`] carrying the
    /// stderr tail. The sidecar is always deleted afterwards.
    pub async fn run_to_completion(
        &self,
        opts: &SidecarOpts,
        spec: &SidecarSpec,
        stdin: Option<Vec<u8>>,
    ) -> Result<RunOutput> {
        let mut bundle = self.prepare(opts, spec).await?;
        let id = bundle.id().to_string();
        debug!(sidecar = %id, execution_id = %opts.execution_id, "running {}", spec.args.join(" "));

        let result = tokio::time::timeout(
            ONE_SHOT_TIMEOUT,
            self.runner.run(&id, bundle.path(), stdin),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                operation: format!("sidecar {id}"),
                duration: ONE_SHOT_TIMEOUT,
            })
        });

        self.release(&id, &mut bundle).await;

        let output = result?;
        if !output.is_success() {
            return Err(Error::RuntimeIo {
                command: spec.args.join(" "),
                stderr: format!(
                    "exit status {}: {}",
                    output.exit_code,
                    output.stderr_tail(STDERR_TAIL_LEN)
                ),
            });
        }
        Ok(output)
    }

    /// Starts a long-running sidecar in the background.
    pub async fn spawn(&self, opts: &SidecarOpts, spec: &SidecarSpec) -> Result<Sidecar> {
        let mut bundle = self.prepare(opts, spec).await?;
        let id = bundle.id().to_string();
        info!(sidecar = %id, execution_id = %opts.execution_id, "starting {}", spec.args.join(" "));

        match self.runner.spawn(&id, bundle.path()).await {
            Ok(process) => Ok(Sidecar {
                id,
                bundle: Some(bundle),
                process,
            }),
            Err(e) => {
                self.release(&id, &mut bundle).await;
                Err(e)
            }
        }
    }

    /// Stops a sidecar and releases its bundle. Idempotent.
    ///
    /// Sends SIGINT, waits up to 10s, sends SIGTERM, waits up to 5s, then
    /// SIGKILL. "Does not exist" answers count as already stopped.
    pub async fn stop(&self, sidecar: &mut Sidecar) -> Result<()> {
        let Some(mut bundle) = sidecar.bundle.take() else {
            return Ok(());
        };
        let id = sidecar.id.clone();

        if sidecar.exited().is_none() {
            for (signal, wait) in [
                (Signal::Int, SIDECAR_GRACE_PERIOD),
                (Signal::Term, SIDECAR_KILL_PERIOD),
                (Signal::Kill, SIDECAR_KILL_PERIOD),
            ] {
                match self.runner.kill(&id, signal, true).await {
                    Ok(()) => debug!(sidecar = %id, "sent {}", signal),
                    Err(e) if e.is_not_found() => break,
                    Err(e) => warn!(sidecar = %id, "failed to send {}: {}", signal, e),
                }
                if sidecar.process.wait_timeout(wait).await.is_some() {
                    break;
                }
                info!(sidecar = %id, "sidecar still running after {}", signal);
            }
        }

        self.release(&id, &mut bundle).await;
        if bundle.path().exists() {
            sidecar.bundle = Some(bundle);
            return Err(Error::Internal(format!("bundle of sidecar {id} could not be removed")));
        }
        Ok(())
    }

    /// Deletes the container and removes the bundle, logging failures.
    async fn release(&self, id: &str, bundle: &mut Bundle) {
        match self.runner.delete(id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(sidecar = %id, "failed to delete sidecar: {}", e),
        }
        if let Err(e) = bundle.remove() {
            warn!(sidecar = %id, "failed to remove bundle: {}", e);
        }
    }

    /// Removes every bundle in the workdir that belongs to `execution_id`.
    pub async fn cleanup_execution(&self, execution_id: Uuid) -> Result<Vec<String>> {
        let wanted = execution_id.to_string();
        sweep(self.workdir(), self.runner.as_ref(), |bundle| {
            bundle.spec().annotations.get(EXECUTION_ANNOTATION) == Some(&wanted)
        })
        .await
    }
}

/// Removes sidecar bundles whose id is not in `live_ids`.
///
/// Used at startup to reconcile bundles left behind by a crash.
pub async fn sweep_orphans(
    workdir: &Path,
    runner: &dyn OciRunner,
    live_ids: &HashSet<String>,
) -> Result<Vec<String>> {
    sweep(workdir, runner, |bundle| !live_ids.contains(bundle.id())).await
}

async fn sweep<F>(workdir: &Path, runner: &dyn OciRunner, select: F) -> Result<Vec<String>>
where
    F: Fn(&Bundle) -> bool,
{
    let mut removed = Vec::new();
    let entries = match std::fs::read_dir(workdir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };

    let dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("sb-"))
        })
        .collect();

    for dir in dirs {
        let mut bundle = match Bundle::load(&dir) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("skipping unreadable bundle {}: {}", dir.display(), e);
                continue;
            }
        };
        if !select(&bundle) {
            continue;
        }
        let id = bundle.id().to_string();
        match runner.delete(&id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(sidecar = %id, "failed to delete orphaned sidecar: {}", e),
        }
        match bundle.remove() {
            Ok(()) => {
                info!(sidecar = %id, "removed orphaned bundle");
                removed.push(id);
            }
            Err(e) => warn!(sidecar = %id, "failed to remove orphaned bundle: {}", e),
        }
    }
    Ok(removed)
}
