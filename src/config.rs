//! Agent configuration read from `STEADYBIT_EXTENSION_*` environment variables.
//!
//! ```text
//! STEADYBIT_EXTENSION_CONTAINER_RUNTIME=containerd
//! STEADYBIT_EXTENSION_DISALLOW_K8S_NAMESPACES=kube-*,steadybit-agent
//! STEADYBIT_EXTENSION_RUNC_ROOT=/run/containerd/runc/k8s.io
//! ```
//!
//! Every value has a default; runtime-dependent defaults (socket, runc root)
//! are derived from the selected runtime.

use crate::client::RuntimeKind;
use crate::constants::{
    CONTAINERD_NAMESPACE, DEFAULT_MEMFILL_PATH, DEFAULT_SIDECAR_IMAGE_PATH, DEFAULT_WORKDIR,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of all environment variables read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "STEADYBIT_EXTENSION_";

/// Settings passed to every `runc` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuncConfig {
    /// State root (`runc --root`).
    pub root: PathBuf,
    /// Rootless mode (`auto`, `true` or `false`).
    pub rootless: String,
    /// Use systemd to manage cgroups.
    pub systemd_cgroup: bool,
    /// Enable runc debug logging.
    pub debug: bool,
}

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Container runtime the agent talks to.
    pub container_runtime: RuntimeKind,
    /// Socket of the container runtime.
    pub container_socket: PathBuf,
    /// containerd namespace holding the containers.
    pub containerd_namespace: String,
    /// Glob patterns of Kubernetes namespaces that must not be attacked.
    pub disallow_k8s_namespaces: Vec<String>,
    /// runc settings.
    pub runc: RuncConfig,
    /// Port of the action HTTP surface (excluded from network attacks).
    pub port: u16,
    /// Port of the health endpoint (excluded from network attacks).
    pub health_port: u16,
    /// Interval between discovery runs.
    #[serde(with = "duration_millis")]
    pub discovery_call_interval: Duration,
    /// Glob patterns of attribute keys dropped from discovered targets.
    pub discovery_attributes_excludes: Vec<String>,
    /// Ignore the `steadybit.com/discovery-disabled` label.
    pub disable_discovery_excludes: bool,
    /// Host path of the memfill binary.
    pub memfill_path: PathBuf,
    /// Root filesystem (directory or tarball) used for sidecars.
    pub sidecar_image_path: PathBuf,
    /// Directory holding sidecar bundles.
    pub workdir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_runtime(RuntimeKind::Docker)
    }
}

impl Config {
    /// Returns the default configuration for the given runtime.
    pub fn for_runtime(runtime: RuntimeKind) -> Self {
        Self {
            container_runtime: runtime,
            container_socket: PathBuf::from(runtime.default_socket()),
            containerd_namespace: CONTAINERD_NAMESPACE.to_string(),
            disallow_k8s_namespaces: Vec::new(),
            runc: RuncConfig {
                root: PathBuf::from(runtime.default_runc_root()),
                rootless: "auto".to_string(),
                systemd_cgroup: false,
                debug: false,
            },
            port: 8086,
            health_port: 8082,
            discovery_call_interval: Duration::from_secs(30),
            discovery_attributes_excludes: Vec::new(),
            disable_discovery_excludes: false,
            memfill_path: PathBuf::from(DEFAULT_MEMFILL_PATH),
            sidecar_image_path: PathBuf::from(DEFAULT_SIDECAR_IMAGE_PATH),
            workdir: PathBuf::from(DEFAULT_WORKDIR),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which receives full
    /// variable names (including [`ENV_PREFIX`]).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let runtime = match get("CONTAINER_RUNTIME") {
            Some(value) => value.parse::<RuntimeKind>()?,
            None => RuntimeKind::Docker,
        };
        let mut config = Self::for_runtime(runtime);

        if let Some(socket) = get("CONTAINER_SOCKET") {
            config.container_socket = PathBuf::from(socket);
        }
        if let Some(ns) = get("CONTAINERD_NAMESPACE") {
            config.containerd_namespace = ns;
        }
        if let Some(list) = get("DISALLOW_K8S_NAMESPACES") {
            config.disallow_k8s_namespaces = split_list(&list);
        }
        if let Some(root) = get("RUNC_ROOT") {
            config.runc.root = PathBuf::from(root);
        }
        if let Some(rootless) = get("RUNC_ROOTLESS") {
            match rootless.as_str() {
                "auto" | "true" | "false" => config.runc.rootless = rootless,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "{ENV_PREFIX}RUNC_ROOTLESS must be auto, true or false, got '{other}'"
                    )));
                }
            }
        }
        if let Some(value) = get("RUNC_SYSTEMD_CGROUP") {
            config.runc.systemd_cgroup = parse_bool("RUNC_SYSTEMD_CGROUP", &value)?;
        }
        if let Some(value) = get("RUNC_DEBUG") {
            config.runc.debug = parse_bool("RUNC_DEBUG", &value)?;
        }
        if let Some(value) = get("PORT") {
            config.port = parse_port("PORT", &value)?;
        }
        if let Some(value) = get("HEALTH_PORT") {
            config.health_port = parse_port("HEALTH_PORT", &value)?;
        }
        if let Some(value) = get("DISCOVERY_CALL_INTERVAL") {
            config.discovery_call_interval = parse_duration(&value)?;
        }
        if let Some(list) = get("DISCOVERY_ATTRIBUTES_EXCLUDES_CONTAINER") {
            config.discovery_attributes_excludes = split_list(&list);
        }
        if let Some(value) = get("DISABLE_DISCOVERY_EXCLUDES") {
            config.disable_discovery_excludes = parse_bool("DISABLE_DISCOVERY_EXCLUDES", &value)?;
        }
        if let Some(path) = get("MEMFILL_PATH") {
            config.memfill_path = PathBuf::from(path);
        }
        if let Some(path) = get("SIDECAR_IMAGE_PATH") {
            config.sidecar_image_path = PathBuf::from(path);
        }
        if let Some(path) = get("WORKDIR") {
            config.workdir = PathBuf::from(path);
        }

        for pattern in config
            .disallow_k8s_namespaces
            .iter()
            .chain(&config.discovery_attributes_excludes)
        {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::InvalidConfig(format!("invalid glob pattern '{pattern}': {e}"))
            })?;
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::InvalidConfig(format!(
            "{ENV_PREFIX}{name} must be a boolean, got '{value}'"
        ))),
    }
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    value.parse::<u16>().map_err(|e| {
        Error::InvalidConfig(format!("{ENV_PREFIX}{name} must be a port, got '{value}': {e}"))
    })
}

/// Parses durations like `500ms`, `30s`, `5m`, `1h`. A bare number is
/// taken as milliseconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration '{value}'")))?;
    let duration = match unit {
        "" | "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        _ => return Err(Error::InvalidConfig(format!("invalid duration unit in '{value}'"))),
    };
    Ok(duration)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
