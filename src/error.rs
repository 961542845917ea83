//! Error types for the sidecar execution and attack engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, running or reverting an attack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Target Errors
    // =========================================================================
    /// The request carried no container id.
    #[error("target is missing the '{0}' attribute")]
    TargetMissing(String),

    /// The container runtime does not know the container.
    #[error("container not found: {0}")]
    TargetNotFound(String),

    /// The target lives in a namespace that must not be attacked.
    #[error("container is in namespace '{namespace}' which matches the disallowed pattern '{pattern}'")]
    Disallowed { namespace: String, pattern: String },

    /// The target shares the host network and the attack refuses it.
    #[error("container '{0}' is using the host network and failOnHostNetwork is enabled")]
    HostNetworkRefused(String),

    /// Another network attack already owns the target's network namespace.
    #[error(
        "running multiple network attacks at the same time on the same network namespace is not supported (namespace inode {inode})"
    )]
    AlreadyAttacked { inode: u64 },

    // =========================================================================
    // Sidecar Errors
    // =========================================================================
    /// The OCI runtime subprocess failed.
    #[error("{command} failed: {stderr}")]
    RuntimeIo { command: String, stderr: String },

    /// A sidecar exited with a code that is not ignored.
    #[error("sidecar '{id}' exited unexpectedly: exit status {exit_code}: {stderr}")]
    SidecarExitUnexpected {
        id: String,
        exit_code: i32,
        stderr: String,
    },

    /// A sidecar exited with a code listed as acceptable.
    #[error("sidecar '{id}' exited with ignored exit status {exit_code}")]
    SidecarExitIgnored { id: String, exit_code: i32 },

    /// Building the sidecar bundle failed.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    /// Path traversal attempt detected in the sidecar image archive.
    #[error("path traversal detected in sidecar image: {path}")]
    PathTraversal { path: String },

    /// A namespace handle of the target could not be resolved.
    #[error("namespace {kind} of pid {pid} is not available")]
    NamespaceUnavailable { kind: String, pid: u32 },

    // =========================================================================
    // Kernel State Errors
    // =========================================================================
    /// A cgroup file was missing or could not be parsed.
    #[error("failed to read cgroup file {path}: {reason}")]
    CgroupReadFailed { path: PathBuf, reason: String },

    /// Hostname resolution inside the target failed.
    #[error("could not resolve hostnames {hostnames:?}: {reason}")]
    ResolutionFailed {
        hostnames: Vec<String>,
        reason: String,
    },

    /// The network namespace vanished before the revert could run.
    #[error("network namespace of '{0}' is gone, skipping revert")]
    RevertSkipped(String),

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Action configuration or environment value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation is not supported by the runtime.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// A stop arrived while the execution was starting.
    #[error("start of execution {0} was cancelled")]
    Cancelled(uuid::Uuid),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for the error kinds that are handled where they occur
    /// instead of being surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CgroupReadFailed { .. } | Self::RevertSkipped(_))
    }

    /// Returns true if the error stems from the container not existing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TargetNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Keeps the last `max` bytes of a subprocess' stderr, trimmed.
pub(crate) fn stderr_tail(stderr: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(
            Error::CgroupReadFailed {
                path: PathBuf::from("/sys/fs/cgroup/cpu.max"),
                reason: "missing".to_string(),
            }
            .is_recoverable()
        );
        assert!(Error::RevertSkipped("abc".to_string()).is_recoverable());
        assert!(!Error::AlreadyAttacked { inode: 1 }.is_recoverable());
        assert!(!Error::TargetNotFound("abc".to_string()).is_recoverable());
    }

    #[test]
    fn test_stderr_tail_truncates_front() {
        let tail = stderr_tail(b"0123456789", 4);
        assert_eq!(tail, "6789");
        assert_eq!(stderr_tail(b"  short \n", 100), "short");
    }
}
