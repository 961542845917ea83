//! Target process introspection.
//!
//! Reads what the engine needs to know about a target container's init
//! process from procfs: its namespace handles (with inodes, so stale handles
//! can be detected later), its cgroup path and the CPUs it may run on.
//!
//! All readers take the proc root as a parameter so they can be pointed at
//! fixture trees.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

// =============================================================================
// Namespaces
// =============================================================================

/// Linux namespace kinds a sidecar may inherit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Pid,
    Net,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

impl NamespaceKind {
    /// All kinds in the order they are captured.
    pub const ALL: [NamespaceKind; 7] = [
        Self::Pid,
        Self::Net,
        Self::Mount,
        Self::Ipc,
        Self::Uts,
        Self::User,
        Self::Cgroup,
    ];

    /// Entry name below `/proc/<pid>/ns/`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Mount => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }

    /// Namespace type as written in an OCI `config.json`.
    pub fn oci_type(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Net => "network",
            Self::Mount => "mount",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// A namespace handle of the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub kind: NamespaceKind,
    /// `/proc/<pid>/ns/<type>`.
    pub path: PathBuf,
    /// Inode of the namespace at capture time.
    pub inode: u64,
}

impl Namespace {
    /// Returns true if the handle still refers to the captured namespace.
    pub fn is_current(&self) -> bool {
        namespace_inode(&self.path).is_ok_and(|inode| inode == self.inode)
    }
}

/// Returns the inode of the namespace behind `path`.
pub fn namespace_inode(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.ino())
}

// =============================================================================
// Target Process
// =============================================================================

/// The kernel context of a target container, immutable for one attack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProcess {
    pub pid: u32,
    /// Cgroup path relative to the cgroup mount (e.g. `/kubepods/pod1/abc`).
    pub cgroup_path: String,
    pub namespaces: Vec<Namespace>,
}

impl TargetProcess {
    /// Inspects `pid` below `proc_root`.
    pub fn inspect(proc_root: &Path, pid: u32) -> Result<Self> {
        let ns_dir = proc_root.join(pid.to_string()).join("ns");
        if !ns_dir.exists() {
            return Err(Error::TargetNotFound(format!("process {pid}")));
        }

        let mut namespaces = Vec::new();
        for kind in NamespaceKind::ALL {
            let path = ns_dir.join(kind.proc_name());
            match namespace_inode(&path) {
                Ok(inode) => namespaces.push(Namespace { kind, path, inode }),
                Err(_) => tracing::debug!("namespace {} of pid {} not available", kind, pid),
            }
        }

        let cgroup_path = read_cgroup_path(proc_root, pid)?;

        Ok(Self {
            pid,
            cgroup_path,
            namespaces,
        })
    }

    /// Returns the captured namespace of the given kind.
    pub fn namespace(&self, kind: NamespaceKind) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.kind == kind)
    }

    /// Returns the namespace or fails with [`Error::NamespaceUnavailable`].
    pub fn require_namespace(&self, kind: NamespaceKind) -> Result<&Namespace> {
        self.namespace(kind).ok_or_else(|| Error::NamespaceUnavailable {
            kind: kind.to_string(),
            pid: self.pid,
        })
    }

    /// Inode of the network namespace, if captured.
    pub fn net_inode(&self) -> Option<u64> {
        self.namespace(NamespaceKind::Net).map(|ns| ns.inode)
    }

    /// Returns true if the target shares the network namespace of PID 1.
    pub fn uses_host_network(&self, proc_root: &Path) -> bool {
        let host = proc_root.join("1").join("ns").join("net");
        match (self.net_inode(), namespace_inode(&host)) {
            (Some(own), Ok(host)) => own == host,
            _ => false,
        }
    }
}

// =============================================================================
// Cgroup Path
// =============================================================================

/// Reads the cgroup path of `pid`.
///
/// Prefers the cpu/memory controller line of a cgroup v1 hierarchy and falls
/// back to the unified (`0::`) line.
pub fn read_cgroup_path(proc_root: &Path, pid: u32) -> Result<String> {
    let path = proc_root.join(pid.to_string()).join("cgroup");
    let content = std::fs::read_to_string(&path).map_err(|e| Error::CgroupReadFailed {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    parse_cgroup_file(&content).ok_or_else(|| Error::CgroupReadFailed {
        path,
        reason: "no cgroup entry found".to_string(),
    })
}

/// Parses the content of `/proc/<pid>/cgroup`.
pub fn parse_cgroup_file(content: &str) -> Option<String> {
    let mut unified = None;
    let mut v1 = None;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(_), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if controllers.is_empty() {
            unified = Some(path.to_string());
        } else if controllers.split(',').any(|c| c == "cpu" || c == "memory") && v1.is_none() {
            v1 = Some(path.to_string());
        }
    }
    v1.or(unified)
}

// =============================================================================
// CPU Pinning
// =============================================================================

/// Returns the number of CPUs in `Cpus_allowed_list` of `pid`.
pub fn read_cpus_allowed(proc_root: &Path, pid: u32) -> Result<usize> {
    let path = proc_root.join(pid.to_string()).join("status");
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .find_map(|l| l.strip_prefix("Cpus_allowed_list:"))
        .and_then(|list| parse_cpu_list(list.trim()))
        .ok_or_else(|| Error::Internal(format!("no Cpus_allowed_list in {}", path.display())))
}

/// Counts the CPUs in a list like `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Option<usize> {
    let mut count = 0;
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((from, to)) => {
                let from: usize = from.parse().ok()?;
                let to: usize = to.parse().ok()?;
                if to < from {
                    return None;
                }
                count += to - from + 1;
            }
            None => {
                part.parse::<usize>().ok()?;
                count += 1;
            }
        }
    }
    (count > 0).then_some(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup_v2() {
        let content = "0::/kubepods.slice/kubepods-pod1.slice/cri-containerd-abc.scope\n";
        assert_eq!(
            parse_cgroup_file(content).as_deref(),
            Some("/kubepods.slice/kubepods-pod1.slice/cri-containerd-abc.scope")
        );
    }

    #[test]
    fn test_parse_cgroup_v1_prefers_controller() {
        let content = "12:pids:/docker/abc\n\
                       4:cpu,cpuacct:/docker/abc\n\
                       3:memory:/docker/abc\n\
                       0::/system.slice/containerd.service\n";
        assert_eq!(parse_cgroup_file(content).as_deref(), Some("/docker/abc"));
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), Some(4));
        assert_eq!(parse_cpu_list("0-3,8,10-11"), Some(7));
        assert_eq!(parse_cpu_list("5"), Some(1));
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list(""), None);
    }

    #[test]
    fn test_inspect_self() {
        let pid = std::process::id();
        let target = TargetProcess::inspect(Path::new("/proc"), pid).unwrap();
        assert_eq!(target.pid, pid);
        let net = target.require_namespace(NamespaceKind::Net).unwrap();
        assert!(net.is_current());
        assert_eq!(net.path, PathBuf::from(format!("/proc/{pid}/ns/net")));
    }

    #[test]
    fn test_stale_namespace() {
        let ns = Namespace {
            kind: NamespaceKind::Net,
            path: PathBuf::from("/proc/self/ns/net"),
            inode: 1,
        };
        assert!(!ns.is_current());
        let gone = Namespace {
            kind: NamespaceKind::Net,
            path: PathBuf::from("/proc/999999999/ns/net"),
            inode: 1,
        };
        assert!(!gone.is_current());
    }

    #[test]
    fn test_missing_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = TargetProcess::inspect(temp.path(), 42).unwrap_err();
        assert!(err.is_not_found());
    }
}
