//! Fill the memory of a container with the host's `memfill` binary.

use super::execution::{ExitPolicy, launch_sidecar};
use super::params::Params;
use super::target::resolve_target;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter, ParameterKind,
    PrepareResult, StartResult,
};
use crate::bundle::SpecEdit;
use crate::constants::{EXIT_CODE_OOM_KILLED, MEMFILL_MOUNTPOINT};
use crate::error::{Error, Result};
use crate::introspect::NamespaceKind;
use crate::memfill::{MemfillMode, MemfillOpts, MemfillUnit};
use crate::sidecar::{SidecarOpts, SidecarSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillMemoryState {
    execution_id: Uuid,
    sidecar: SidecarOpts,
    args: Vec<String>,
    policy: ExitPolicy,
}

pub struct FillMemory;

fn memfill_opts(config: &Value) -> Result<(MemfillOpts, bool)> {
    let params = Params::new(config);
    // `percentage` is shorthand for `size` with the `percent` unit.
    let (size, unit) = match params.u64("percentage")? {
        Some(pct) => (pct, MemfillUnit::Percent),
        None => (
            params.u64_or("size", 80)?,
            params.string_or("unit", "percent")?.parse::<MemfillUnit>()?,
        ),
    };
    if size == 0 || (unit == MemfillUnit::Percent && size > 100) {
        return Err(Error::InvalidConfig(format!("invalid fill memory size {size}")));
    }
    let opts = MemfillOpts {
        size,
        unit,
        mode: params.string_or("mode", "usage")?.parse::<MemfillMode>()?,
        duration_secs: params.duration_secs()?,
    };
    Ok((opts, params.bool_or("failOnOomKill", false)?))
}

#[async_trait]
impl Action for FillMemory {
    fn describe(&self) -> ActionDescription {
        ActionDescription::new(
            "fill_memory",
            "Fill Memory",
            "Fills the memory of the container for the given duration.",
            "resource",
        )
        .parameter(Parameter::duration("30000"))
        .parameter(
            Parameter::new("mode", "Mode", ParameterKind::String)
                .default_value("usage")
                .options(&["usage", "absolute"]),
        )
        .parameter(
            Parameter::new("percentage", "Load on Container Memory", ParameterKind::Percentage)
                .default_value("80")
                .required(),
        )
        .parameter(
            Parameter::new("size", "Size", ParameterKind::Integer).advanced(),
        )
        .parameter(
            Parameter::new("unit", "Unit", ParameterKind::String)
                .default_value("percent")
                .options(&["percent", "megabytes"])
                .advanced(),
        )
        .parameter(
            Parameter::new("failOnOomKill", "Fail on OOM Kill", ParameterKind::Boolean)
                .default_value("false")
                .advanced(),
        )
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        let (opts, fail_on_oom_kill) = memfill_opts(&request.config)?;
        let target = resolve_target(ctx, request).await?;
        let limit = match ctx.cgroups.memory_limit_bytes(&target.process.cgroup_path) {
            Ok(limit) => limit,
            Err(e) => {
                warn!("skipping memory adaptation: {}", e);
                None
            }
        };

        let mut policy = ExitPolicy::until_exit();
        if !fail_on_oom_kill {
            policy = policy.ignoring(&[EXIT_CODE_OOM_KILLED]);
        }
        PrepareResult::new(&FillMemoryState {
            execution_id: request.execution_id,
            sidecar: target.sidecar,
            args: opts.args(limit),
            policy,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: FillMemoryState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            let spec = SidecarSpec::new("memfill", state.args.clone())
                .with_namespaces(&[NamespaceKind::Pid, NamespaceKind::Uts])
                .in_cgroup("memfill")
                .with_edit(SpecEdit::BindMount {
                    source: ctx.config.memfill_path.to_string_lossy().into_owned(),
                    destination: MEMFILL_MOUNTPOINT.to_string(),
                    readonly: true,
                });
            let execution =
                launch_sidecar(ctx, state.sidecar.clone(), &spec, state.policy.clone(), None).await?;
            let result = StartResult {
                messages: vec![Message::info(format!("started {}", state.args.join(" ")))],
                error: None,
            };
            Ok((execution, result))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memfill_opts() {
        let (opts, fail) = memfill_opts(&json!({"duration": 2500, "size": 256, "unit": "megabytes", "mode": "absolute"}))
            .unwrap();
        assert_eq!(opts.size, 256);
        assert_eq!(opts.unit, MemfillUnit::Megabytes);
        assert_eq!(opts.mode, MemfillMode::Absolute);
        assert_eq!(opts.duration_secs, 3);
        assert!(!fail);
    }

    #[test]
    fn test_memfill_percentage() {
        let (opts, fail) = memfill_opts(&json!({"duration": 1000, "percentage": 50, "failOnOomKill": true}))
            .unwrap();
        assert_eq!(opts.size, 50);
        assert_eq!(opts.unit, MemfillUnit::Percent);
        assert_eq!(opts.mode, MemfillMode::Usage);
        assert!(fail);

        // `percentage` wins over `size` and `unit`.
        let (opts, _) = memfill_opts(&json!({"duration": 1000, "percentage": "30", "size": 512, "unit": "megabytes"}))
            .unwrap();
        assert_eq!((opts.size, opts.unit), (30, MemfillUnit::Percent));
        assert!(memfill_opts(&json!({"duration": 1000, "percentage": 120})).is_err());
    }

    #[test]
    fn test_memfill_opts_rejects_bad_size() {
        assert!(memfill_opts(&json!({"duration": 1000, "size": 0})).is_err());
        assert!(memfill_opts(&json!({"duration": 1000, "size": 150, "unit": "percent"})).is_err());
        assert!(memfill_opts(&json!({"size": 50})).is_err());
    }
}
