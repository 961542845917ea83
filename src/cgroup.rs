//! Cgroup limit reading and stress parameter adaptation.
//!
//! Reads the effective CPU and memory budget of a target from cgroup v1 or
//! v2 files and rewrites stress parameters so the generated load is relative
//! to what the container may actually use.
//!
//! | Limit  | cgroup v1                                   | cgroup v2     |
//! |--------|---------------------------------------------|---------------|
//! | CPU    | `cpu.cfs_quota_us` / `cpu.cfs_period_us`    | `cpu.max`     |
//! | Memory | `memory.limit_in_bytes`                     | `memory.max`  |
//! | Usage  | `memory.usage_in_bytes`                     | `memory.current` |

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Cgroup hierarchy flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Reads limits below a cgroup mount point.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    root: PathBuf,
}

impl CgroupReader {
    /// Creates a reader for the cgroup filesystem mounted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Detects the hierarchy flavour.
    pub fn version(&self) -> CgroupVersion {
        if self.root.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }

    fn v1_file(&self, controllers: &[&str], cgroup_path: &str, file: &str) -> PathBuf {
        let relative = cgroup_path.trim_start_matches('/');
        controllers
            .iter()
            .map(|c| self.root.join(c).join(relative).join(file))
            .find(|p| p.exists())
            .unwrap_or_else(|| self.root.join(controllers[0]).join(relative).join(file))
    }

    fn v2_file(&self, cgroup_path: &str, file: &str) -> PathBuf {
        self.root.join(cgroup_path.trim_start_matches('/')).join(file)
    }

    /// Returns the CPU limit in milli-CPUs, `None` if unlimited.
    pub fn cpu_limit_millis(&self, cgroup_path: &str) -> Result<Option<u64>> {
        match self.version() {
            CgroupVersion::V2 => {
                let path = self.v2_file(cgroup_path, "cpu.max");
                let content = read_file(&path)?;
                parse_cpu_max(&content).map_err(|reason| Error::CgroupReadFailed { path, reason })
            }
            CgroupVersion::V1 => {
                let controllers = ["cpu,cpuacct", "cpu"];
                let quota_path = self.v1_file(&controllers, cgroup_path, "cpu.cfs_quota_us");
                let period_path = self.v1_file(&controllers, cgroup_path, "cpu.cfs_period_us");
                let quota = read_file(&quota_path)?;
                let period = read_file(&period_path)?;
                let quota: i64 = quota.trim().parse().map_err(|e| Error::CgroupReadFailed {
                    path: quota_path,
                    reason: format!("{e}"),
                })?;
                let period: u64 = period.trim().parse().map_err(|e| Error::CgroupReadFailed {
                    path: period_path.clone(),
                    reason: format!("{e}"),
                })?;
                if quota < 0 {
                    return Ok(None);
                }
                if period == 0 {
                    return Err(Error::CgroupReadFailed {
                        path: period_path,
                        reason: "period is zero".to_string(),
                    });
                }
                Ok(Some(quota as u64 * 1000 / period))
            }
        }
    }

    /// Returns the memory limit in bytes, `None` if unlimited.
    pub fn memory_limit_bytes(&self, cgroup_path: &str) -> Result<Option<u64>> {
        let (path, sentinel) = match self.version() {
            CgroupVersion::V2 => (self.v2_file(cgroup_path, "memory.max"), None),
            CgroupVersion::V1 => (
                self.v1_file(&["memory"], cgroup_path, "memory.limit_in_bytes"),
                Some(v1_unlimited_sentinel()),
            ),
        };
        let content = read_file(&path)?;
        parse_memory_limit(&content, sentinel).map_err(|reason| Error::CgroupReadFailed { path, reason })
    }

    /// Returns the current memory usage in bytes.
    pub fn memory_usage_bytes(&self, cgroup_path: &str) -> Result<u64> {
        let path = match self.version() {
            CgroupVersion::V2 => self.v2_file(cgroup_path, "memory.current"),
            CgroupVersion::V1 => self.v1_file(&["memory"], cgroup_path, "memory.usage_in_bytes"),
        };
        let content = read_file(&path)?;
        content.trim().parse().map_err(|e| Error::CgroupReadFailed {
            path,
            reason: format!("{e}"),
        })
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::CgroupReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parses `cpu.max` (`"<quota> <period>"` or `"max <period>"`).
pub fn parse_cpu_max(content: &str) -> std::result::Result<Option<u64>, String> {
    let mut parts = content.split_whitespace();
    let quota = parts.next().ok_or("empty cpu.max")?;
    if quota == "max" || quota == "-1" {
        return Ok(None);
    }
    let quota: u64 = quota.parse().map_err(|e| format!("invalid quota: {e}"))?;
    let period: u64 = match parts.next() {
        Some(p) => p.parse().map_err(|e| format!("invalid period: {e}"))?,
        None => 100_000,
    };
    if period == 0 {
        return Err("period is zero".to_string());
    }
    Ok(Some(quota * 1000 / period))
}

/// Parses a memory limit file. `max`, `-1` and values at or above the
/// cgroup v1 `sentinel` mean unlimited.
pub fn parse_memory_limit(
    content: &str,
    sentinel: Option<u64>,
) -> std::result::Result<Option<u64>, String> {
    let value = content.trim();
    if value == "max" || value == "-1" {
        return Ok(None);
    }
    let bytes: u64 = value.parse().map_err(|e| format!("invalid memory limit: {e}"))?;
    if sentinel.is_some_and(|s| bytes >= s) {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// The value cgroup v1 reports for "no limit": `(i64::MAX / pagesize) * pagesize`.
pub fn v1_unlimited_sentinel() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
    (i64::MAX as u64 / page_size) * page_size
}

// =============================================================================
// Adaptation
// =============================================================================

/// Worker count and per-worker load for `stress-ng --cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPlan {
    pub workers: u32,
    pub load: u32,
}

/// Rewrites CPU workers and load relative to the container's CPU budget.
///
/// * unlimited, `workers == 0`: one worker per allowed CPU, load unchanged;
/// * limited: the aggregate load is `limit * load / 100` milli-CPUs, spread
///   over `workers` (or `ceil(desired / 1000)` workers when unset).
pub fn adapt_cpu(limit_millis: Option<u64>, cpus_allowed: usize, workers: u32, load: u32) -> CpuPlan {
    let Some(limit) = limit_millis else {
        let workers = if workers == 0 {
            u32::try_from(cpus_allowed.max(1)).unwrap_or(u32::MAX)
        } else {
            workers
        };
        return CpuPlan { workers, load };
    };

    info!("container cpu limit is {}m", limit);
    let desired = limit * u64::from(load) / 100;
    let workers = if workers == 0 {
        u32::try_from(desired.div_ceil(1000).max(1)).unwrap_or(u32::MAX)
    } else {
        workers
    };
    let per_worker = desired as f64 / f64::from(workers) / 10.0;
    let load = (per_worker.round() as u32).clamp(1, 100);
    debug!("adapted cpu stress to {} workers at {}%", workers, load);
    CpuPlan { workers, load }
}

/// Rewrites a percentage `--vm-bytes` value into kilobytes per worker.
///
/// Non-percentage values, or a missing limit, are returned unchanged.
pub fn adapt_vm_bytes(vm_bytes: &str, limit_bytes: Option<u64>, workers: u32) -> String {
    let (Some(pct), Some(limit)) = (vm_bytes.strip_suffix('%'), limit_bytes) else {
        return vm_bytes.to_string();
    };
    let Ok(pct) = pct.trim().parse::<u64>() else {
        return vm_bytes.to_string();
    };
    info!("container memory limit is {}", limit);
    let bytes = limit * pct / 100;
    let per_worker_kb = (bytes / u64::from(workers.max(1)) / 1024).max(1);
    format!("{per_worker_kb}K")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn v2_tree(cpu_max: &str, memory_max: &str) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("cgroup.controllers"), "cpu memory").unwrap();
        let dir = temp.path().join("kubepods/abc");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpu.max"), cpu_max).unwrap();
        fs::write(dir.join("memory.max"), memory_max).unwrap();
        fs::write(dir.join("memory.current"), "1048576\n").unwrap();
        temp
    }

    #[test]
    fn test_v2_limits() {
        let temp = v2_tree("150000 100000\n", "536870912\n");
        let reader = CgroupReader::new(temp.path());
        assert_eq!(reader.version(), CgroupVersion::V2);
        assert_eq!(reader.cpu_limit_millis("/kubepods/abc").unwrap(), Some(1500));
        assert_eq!(reader.memory_limit_bytes("/kubepods/abc").unwrap(), Some(536870912));
        assert_eq!(reader.memory_usage_bytes("/kubepods/abc").unwrap(), 1048576);
    }

    #[test]
    fn test_v2_unlimited() {
        let temp = v2_tree("max 100000\n", "max\n");
        let reader = CgroupReader::new(temp.path());
        assert_eq!(reader.cpu_limit_millis("/kubepods/abc").unwrap(), None);
        assert_eq!(reader.memory_limit_bytes("/kubepods/abc").unwrap(), None);
    }

    #[test]
    fn test_v1_limits() {
        let temp = TempDir::new().unwrap();
        let cpu = temp.path().join("cpu,cpuacct/docker/abc");
        let mem = temp.path().join("memory/docker/abc");
        fs::create_dir_all(&cpu).unwrap();
        fs::create_dir_all(&mem).unwrap();
        fs::write(cpu.join("cpu.cfs_quota_us"), "20000\n").unwrap();
        fs::write(cpu.join("cpu.cfs_period_us"), "100000\n").unwrap();
        fs::write(mem.join("memory.limit_in_bytes"), v1_unlimited_sentinel().to_string()).unwrap();

        let reader = CgroupReader::new(temp.path());
        assert_eq!(reader.version(), CgroupVersion::V1);
        assert_eq!(reader.cpu_limit_millis("/docker/abc").unwrap(), Some(200));
        assert_eq!(reader.memory_limit_bytes("/docker/abc").unwrap(), None);
    }

    #[test]
    fn test_v1_unlimited_quota() {
        let temp = TempDir::new().unwrap();
        let cpu = temp.path().join("cpu/docker/abc");
        fs::create_dir_all(&cpu).unwrap();
        fs::write(cpu.join("cpu.cfs_quota_us"), "-1\n").unwrap();
        fs::write(cpu.join("cpu.cfs_period_us"), "100000\n").unwrap();
        let reader = CgroupReader::new(temp.path());
        assert_eq!(reader.cpu_limit_millis("/docker/abc").unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_cgroup_read_failed() {
        let temp = TempDir::new().unwrap();
        let reader = CgroupReader::new(temp.path());
        let err = reader.memory_limit_bytes("/nope").unwrap_err();
        assert!(matches!(err, Error::CgroupReadFailed { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_adapt_cpu_limited_without_workers() {
        assert_eq!(adapt_cpu(Some(200), 8, 0, 50), CpuPlan { workers: 1, load: 10 });
    }

    #[test]
    fn test_adapt_cpu_limited_with_one_worker() {
        assert_eq!(adapt_cpu(Some(1500), 8, 1, 60), CpuPlan { workers: 1, load: 90 });
    }

    #[test]
    fn test_adapt_cpu_spreads_over_workers() {
        let plan = adapt_cpu(Some(2500), 8, 0, 100);
        assert_eq!(plan.workers, 3);
        assert_eq!(plan.load, 83);
    }

    #[test]
    fn test_adapt_cpu_unlimited_uses_pinning() {
        assert_eq!(adapt_cpu(None, 4, 0, 80), CpuPlan { workers: 4, load: 80 });
        assert_eq!(adapt_cpu(None, 4, 2, 80), CpuPlan { workers: 2, load: 80 });
    }

    #[test]
    fn test_adapt_vm_bytes() {
        assert_eq!(adapt_vm_bytes("50%", Some(1024 * 1024 * 1024), 2), "262144K");
        assert_eq!(adapt_vm_bytes("50%", None, 2), "50%");
        assert_eq!(adapt_vm_bytes("512M", Some(1024), 1), "512M");
        assert_eq!(adapt_vm_bytes("1%", Some(1024), 1), "1K");
    }
}
