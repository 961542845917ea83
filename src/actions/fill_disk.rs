//! Fill the filesystem behind a path of the container.
//!
//! The target path is bind-mounted into every sidecar of the attack at
//! [`DISK_FILL_MOUNTPOINT`]. Sizing that depends on the current usage runs
//! `df` in a one-shot sidecar at start, so the figure is as fresh as
//! possible. The fill file stays until stop, when a cleanup sidecar removes
//! it.

use super::execution::{ExitPolicy, launch_sidecar};
use super::params::Params;
use super::target::resolve_target;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter, ParameterKind,
    PrepareResult, StartResult,
};
use crate::constants::DISK_FILL_MOUNTPOINT;
use crate::diskfill::{DiskFillMethod, DiskFillMode, DiskFillOpts, cleanup_args, df_args, noop_args};
use crate::diskusage::parse_df;
use crate::error::{Error, Result};
use crate::introspect::NamespaceKind;
use crate::sidecar::{SidecarOpts, SidecarSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// Stderr of `dd`/`fallocate` once the disk is full.
const DISK_FULL: &str = "No space left on device";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillDiskState {
    execution_id: Uuid,
    sidecar: SidecarOpts,
    opts: DiskFillOpts,
}

pub struct FillDisk;

fn fill_disk_opts(config: &Value) -> Result<DiskFillOpts> {
    let params = Params::new(config);
    params.duration_ms()?;
    let opts = DiskFillOpts {
        temp_path: params.string_or("path", "/tmp")?,
        mode: params.string_or("mode", "PERCENTAGE")?.parse::<DiskFillMode>()?,
        size: params.u64_or("size", 80)?,
        block_size_mb: params.u64_or("blocksize", 5)?,
        method: params.string_or("method", "AT_ONCE")?.parse::<DiskFillMethod>()?,
    };
    if opts.mode == DiskFillMode::Percentage && opts.size > 100 {
        return Err(Error::InvalidConfig(format!(
            "fill disk percentage must be between 0 and 100, got {}",
            opts.size
        )));
    }
    if opts.block_size_mb == 0 {
        return Err(Error::InvalidConfig("parameter 'blocksize' must be positive".to_string()));
    }
    Ok(opts)
}

fn disk_fill_spec(path: &str, args: Vec<String>) -> SidecarSpec {
    SidecarSpec::new("disk-fill", args)
        .with_namespaces(&[NamespaceKind::Pid, NamespaceKind::Uts])
        .in_cgroup("disk-fill")
        .with_capabilities(&["CAP_SYS_RESOURCE"])
        .mount_from_target(path, DISK_FILL_MOUNTPOINT)
}

#[async_trait]
impl Action for FillDisk {
    fn describe(&self) -> ActionDescription {
        ActionDescription::new(
            "fill_disk",
            "Fill Disk",
            "Fills the disk of the container for the given duration.",
            "resource",
        )
        .parameter(Parameter::duration("30000"))
        .parameter(
            Parameter::new("mode", "Mode", ParameterKind::String)
                .default_value("PERCENTAGE")
                .options(&["PERCENTAGE", "MB_TO_FILL", "MB_LEFT"])
                .required(),
        )
        .parameter(
            Parameter::new("size", "Fill Value", ParameterKind::Integer)
                .default_value("80")
                .required(),
        )
        .parameter(
            Parameter::new("path", "File Destination", ParameterKind::String)
                .default_value("/tmp")
                .required(),
        )
        .parameter(
            Parameter::new("method", "Method", ParameterKind::String)
                .default_value("AT_ONCE")
                .options(&["AT_ONCE", "OVER_TIME"])
                .advanced(),
        )
        .parameter(
            Parameter::new("blocksize", "Block Size (in MBytes)", ParameterKind::Integer)
                .default_value("5")
                .advanced(),
        )
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        let opts = fill_disk_opts(&request.config)?;
        let target = resolve_target(ctx, request).await?;
        PrepareResult::new(&FillDiskState {
            execution_id: request.execution_id,
            sidecar: target.sidecar,
            opts,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: FillDiskState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            let path = state.opts.temp_path.as_str();
            let usage = if state.opts.needs_usage() {
                let df = disk_fill_spec(path, df_args());
                let output = ctx.sidecars.run_to_completion(&state.sidecar, &df, None).await?;
                Some(parse_df(&output.stdout_text())?)
            } else {
                None
            };

            let mut messages = Vec::new();
            let size_mb = state.opts.size_to_fill_mb(usage.as_ref())?;
            let args = if size_mb <= 0 {
                let used = usage.map(|u| u.used_percent()).unwrap_or_default();
                info!(execution_id = %state.execution_id, "disk is already filled up to {}%", used);
                messages.push(Message::info(format!("disk is already filled up to {used}%")));
                noop_args()
            } else {
                let args = state.opts.fill_args(size_mb.unsigned_abs());
                messages.push(Message::info(format!("writing {size_mb} MB to {path}")));
                args
            };

            let spec = disk_fill_spec(path, args);
            let cleanup = disk_fill_spec(path, cleanup_args());
            let policy = ExitPolicy::default().tolerating(DISK_FULL);
            let execution =
                launch_sidecar(ctx, state.sidecar.clone(), &spec, policy, Some(cleanup)).await?;
            Ok((
                execution,
                StartResult {
                    messages,
                    error: None,
                },
            ))
        })
        .await
    }
}
