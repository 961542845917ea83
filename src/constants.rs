//! # Engine Constants
//!
//! Well-known paths, labels, identifiers and timeouts used throughout the
//! agent. Values that operators may change live in [`crate::config`]; the
//! constants here are the defaults and protocol-level names.

use std::time::Duration;

// =============================================================================
// Paths
// =============================================================================

/// Directory holding one OCI bundle per running sidecar.
///
/// Structure: `<workdir>/<sidecar-id>/rootfs` + `<workdir>/<sidecar-id>/config.json`
pub const DEFAULT_WORKDIR: &str = "/tmp/steadybit/containers";

/// Location of the root filesystem shipped with the agent for sidecars.
///
/// May be a directory or a `.tar` / `.tar.gz` archive.
pub const DEFAULT_SIDECAR_IMAGE_PATH: &str = "/sidecar";

/// Location of the `memfill` binary on the host.
pub const DEFAULT_MEMFILL_PATH: &str = "/usr/bin/memfill";

/// Root of the proc filesystem.
pub const PROC_ROOT: &str = "/proc";

/// Mount point of the cgroup filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Fixed mount point of the target's temp path inside fill-disk sidecars.
pub const DISK_FILL_MOUNTPOINT: &str = "/disk-fill-temp";

/// File name written by the fill-disk attack.
pub const DISK_FILL_FILE: &str = "disk-fill";

/// Mount point of the memfill binary inside fill-memory sidecars.
pub const MEMFILL_MOUNTPOINT: &str = "/memfill";

/// Mountpoint of the target's temp path in stress-io sidecars.
pub const STRESS_TEMP_MOUNTPOINT: &str = "/stress-temp";

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Annotation set on every sidecar.
pub const SIDECAR_ANNOTATION: &str = "com.steadybit.sidecar";

/// Default PATH inside sidecars.
pub const SIDECAR_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Number of characters of the target container id used in sidecar ids.
pub const ID_SUFFIX_LEN: usize = 8;

/// Maximum number of stderr bytes kept when reporting sidecar failures.
pub const STDERR_TAIL_LEN: usize = 1024;

// =============================================================================
// Runtimes
// =============================================================================

/// Default Docker socket.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// runc state root used by Docker.
pub const DOCKER_RUNC_ROOT: &str = "/run/docker/runtime-runc/moby";

/// Default containerd socket.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

/// runc state root used by containerd for the `k8s.io` namespace.
pub const CONTAINERD_RUNC_ROOT: &str = "/run/containerd/runc/k8s.io";

/// Default containerd namespace.
pub const CONTAINERD_NAMESPACE: &str = "k8s.io";

/// Default CRI-O socket.
pub const CRIO_SOCKET: &str = "/var/run/crio/crio.sock";

/// runc state root used by CRI-O.
pub const CRIO_RUNC_ROOT: &str = "/run/runc";

// =============================================================================
// Timeouts
// =============================================================================

/// Time a sidecar gets to exit after SIGINT before SIGTERM is sent.
pub const SIDECAR_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Time a sidecar gets to exit after SIGTERM before SIGKILL is sent.
pub const SIDECAR_KILL_PERIOD: Duration = Duration::from_secs(5);

/// How long start waits for the stop-container call to fail early.
pub const STOP_EARLY_EXIT_WAIT: Duration = Duration::from_secs(1);

/// How long start waits for a long-running sidecar to fail early.
pub const SIDECAR_EARLY_EXIT_WAIT: Duration = Duration::from_millis(500);

/// Timeout of one-shot sidecars (ip, tc, dig, df).
pub const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-query timeout passed to `dig`.
pub const DIG_TIMEOUT_SECS: u32 = 4;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code of a process killed by SIGKILL (usually the OOM killer).
pub const EXIT_CODE_OOM_KILLED: i32 = 137;

/// Exit code reported when a sidecar was terminated by a signal.
pub const EXIT_CODE_SIGNALED: i32 = -1;

// =============================================================================
// Discovery Labels
// =============================================================================

/// Target type advertised by discovery.
pub const TARGET_TYPE: &str = "com.steadybit.extension_container.container";

/// Prefix of every action id.
pub const ACTION_ID_PREFIX: &str = "com.steadybit.extension_container";

/// Label marking the agent's own containers.
pub const LABEL_AGENT: &str = "com.steadybit.agent";

/// Label opting a container out of discovery.
pub const LABEL_DISCOVERY_DISABLED: &str = "steadybit.com/discovery-disabled";

/// Sandbox containers created by containerd.
pub const LABEL_CRI_CONTAINERD_KIND: &str = "io.cri-containerd.kind";

/// Sandbox containers created by dockershim.
pub const LABEL_DOCKER_TYPE: &str = "io.kubernetes.docker.type";

/// ECS pause container label.
pub const LABEL_ECS_CONTAINER_NAME: &str = "com.amazonaws.ecs.container-name";

/// Kubernetes pod name label.
pub const LABEL_K8S_POD_NAME: &str = "io.kubernetes.pod.name";

/// Kubernetes namespace label.
pub const LABEL_K8S_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";

/// Kubernetes container name label.
pub const LABEL_K8S_CONTAINER_NAME: &str = "io.kubernetes.container.name";

/// Prefix of the recommended Kubernetes app labels.
pub const LABEL_K8S_APP_PREFIX: &str = "app.kubernetes.io/";

// =============================================================================
// Attributes
// =============================================================================

/// Attribute carrying the runtime-prefixed container id.
pub const ATTR_CONTAINER_ID: &str = "container.id";

/// Attribute carrying the bare container id.
pub const ATTR_CONTAINER_ID_STRIPPED: &str = "container.id.stripped";

/// Attribute carrying the Kubernetes namespace.
pub const ATTR_K8S_NAMESPACE: &str = "k8s.namespace";

// =============================================================================
// Container ID Validation Helper
// =============================================================================

/// Valid characters for sidecar ids.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container id length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a sidecar id before it is used as a directory name.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
