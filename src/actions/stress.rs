//! `stress-ng` attacks on CPU, memory and disk I/O.
//!
//! | Action        | Stressors            | Extra namespaces |
//! |---------------|----------------------|------------------|
//! | `stress_cpu`  | `--cpu`              |                  |
//! | `stress_mem`  | `--vm`               |                  |
//! | `stress_io`   | `--hdd` and/or `--io`| ipc              |
//!
//! The sidecar joins the target's pid, cgroup and uts namespaces and runs
//! in a child of its cgroup so the target's limits apply to the stress.

use super::execution::{ExitPolicy, launch_sidecar};
use super::params::Params;
use super::target::resolve_target;
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter, ParameterKind,
    PrepareResult, StartResult,
};
use crate::constants::{EXIT_CODE_OOM_KILLED, STRESS_TEMP_MOUNTPOINT};
use crate::error::{Error, Result};
use crate::introspect::NamespaceKind;
use crate::sidecar::{SidecarOpts, SidecarSpec};
use crate::stress::StressOpts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressKind {
    Cpu,
    Mem,
    Io,
}

impl StressKind {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Cpu => "stress_cpu",
            Self::Mem => "stress_mem",
            Self::Io => "stress_io",
        }
    }
}

/// Which stressors `stress_io` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    ReadWriteAndFlush,
    ReadWrite,
    Flush,
}

impl FromStr for IoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read_write_and_flush" => Ok(Self::ReadWriteAndFlush),
            "read_write" => Ok(Self::ReadWrite),
            "flush" => Ok(Self::Flush),
            other => Err(Error::InvalidConfig(format!("unknown stress io mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StressState {
    execution_id: Uuid,
    kind: StressKind,
    sidecar: SidecarOpts,
    stress: StressOpts,
    /// Target path mounted for the hdd stressor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    policy: ExitPolicy,
}

pub struct StressAttack {
    kind: StressKind,
}

impl StressAttack {
    pub fn cpu() -> Self {
        Self {
            kind: StressKind::Cpu,
        }
    }

    pub fn mem() -> Self {
        Self {
            kind: StressKind::Mem,
        }
    }

    pub fn io() -> Self {
        Self {
            kind: StressKind::Io,
        }
    }

    /// Stressor options and the target path to mount, if any.
    fn options(&self, config: &Value) -> Result<(StressOpts, Option<String>, ExitPolicy)> {
        let params = Params::new(config);
        let mut opts = StressOpts {
            timeout_secs: params.duration_secs()?,
            ..StressOpts::default()
        };
        let mut policy = ExitPolicy::until_exit();
        let mut path = None;

        match self.kind {
            StressKind::Cpu => {
                let load = params.u32_or("cpuLoad", 100)?;
                if load == 0 || load > 100 {
                    return Err(Error::InvalidConfig(format!(
                        "parameter 'cpuLoad' must be between 1 and 100, got {load}"
                    )));
                }
                opts.cpu_workers = Some(params.u32_or("workers", 0)?);
                opts.cpu_load = load;
            }
            StressKind::Mem => {
                let pct = params.percent_or("percentage", 80)?;
                if pct == 0 {
                    return Err(Error::InvalidConfig(
                        "parameter 'percentage' must be positive".to_string(),
                    ));
                }
                opts.vm_workers = Some(1);
                opts.vm_bytes = Some(format!("{pct}%"));
                if !params.bool_or("failOnOomKill", false)? {
                    policy = policy.ignoring(&[EXIT_CODE_OOM_KILLED]);
                }
            }
            StressKind::Io => {
                let workers = params.u32_or("workers", 0)?;
                let mode = params
                    .string_or("mode", "read_write_and_flush")?
                    .parse::<IoMode>()?;
                if matches!(mode, IoMode::ReadWriteAndFlush | IoMode::ReadWrite) {
                    let mbytes = params.u64_or("mbytes_per_worker", 1024)?;
                    opts.hdd_workers = Some(workers);
                    opts.hdd_bytes = Some(format!("{mbytes}m"));
                    opts.temp_path = Some(STRESS_TEMP_MOUNTPOINT.to_string());
                    path = Some(params.string_or("path", "/")?);
                }
                if matches!(mode, IoMode::ReadWriteAndFlush | IoMode::Flush) {
                    opts.io_workers = Some(workers);
                }
            }
        }
        Ok((opts, path, policy))
    }
}

fn stress_spec(state: &StressState) -> SidecarSpec {
    let mut namespaces = vec![NamespaceKind::Pid, NamespaceKind::Cgroup, NamespaceKind::Uts];
    if state.kind == StressKind::Io {
        namespaces.push(NamespaceKind::Ipc);
    }
    let mut spec = SidecarSpec::new("stress", state.stress.args())
        .with_namespaces(&namespaces)
        .in_cgroup("stress")
        .with_capabilities(&["CAP_SYS_RESOURCE"]);
    if let Some(path) = &state.path {
        spec = spec.mount_from_target(path, STRESS_TEMP_MOUNTPOINT);
    }
    spec
}

#[async_trait]
impl Action for StressAttack {
    fn describe(&self) -> ActionDescription {
        let base = match self.kind {
            StressKind::Cpu => ActionDescription::new(
                self.kind.suffix(),
                "Stress CPU",
                "Generates CPU load for one or more cores.",
                "resource",
            )
            .parameter(
                Parameter::new("cpuLoad", "Host CPU Load", ParameterKind::Percentage)
                    .default_value("100")
                    .required(),
            )
            .parameter(
                Parameter::new("workers", "Workers", ParameterKind::Integer)
                    .default_value("0")
                    .advanced(),
            ),
            StressKind::Mem => ActionDescription::new(
                self.kind.suffix(),
                "Stress Memory",
                "Allocates memory within the container's limit.",
                "resource",
            )
            .parameter(
                Parameter::new("percentage", "Load on Container Memory", ParameterKind::Percentage)
                    .default_value("80")
                    .required(),
            )
            .parameter(
                Parameter::new("failOnOomKill", "Fail on OOM Kill", ParameterKind::Boolean)
                    .default_value("false")
                    .advanced(),
            ),
            StressKind::Io => ActionDescription::new(
                self.kind.suffix(),
                "Stress IO",
                "Generates read/write operations on the container's disk.",
                "resource",
            )
            .parameter(
                Parameter::new("mode", "Mode", ParameterKind::String)
                    .default_value("read_write_and_flush")
                    .options(&["read_write_and_flush", "read_write", "flush"]),
            )
            .parameter(
                Parameter::new("path", "Path", ParameterKind::String)
                    .default_value("/")
                    .required(),
            )
            .parameter(
                Parameter::new("mbytes_per_worker", "MBytes to write", ParameterKind::Integer)
                    .default_value("1024"),
            )
            .parameter(
                Parameter::new("workers", "Workers", ParameterKind::Integer)
                    .default_value("0")
                    .advanced(),
            ),
        };
        base.parameter(Parameter::duration("30000"))
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        let (mut stress, path, policy) = self.options(&request.config)?;
        let target = resolve_target(ctx, request).await?;
        stress.adapt_to_target(&ctx.cgroups, &ctx.proc_root, &target.process);

        PrepareResult::new(&StressState {
            execution_id: request.execution_id,
            kind: self.kind,
            sidecar: target.sidecar,
            stress,
            path,
            policy,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: StressState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            let spec = stress_spec(&state);
            let execution =
                launch_sidecar(ctx, state.sidecar.clone(), &spec, state.policy.clone(), None).await?;
            let result = StartResult {
                messages: vec![Message::info(format!(
                    "started {}",
                    state.stress.args().join(" ")
                ))],
                error: None,
            };
            Ok((execution, result))
        })
        .await
    }
}
