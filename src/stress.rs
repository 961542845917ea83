//! `stress-ng` invocation for the stress attacks.

use crate::cgroup::{CgroupReader, adapt_cpu, adapt_vm_bytes};
use crate::introspect::{TargetProcess, read_cpus_allowed};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Stressor selection of one `stress-ng` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressOpts {
    /// `0` means one worker per usable CPU.
    pub cpu_workers: Option<u32>,
    pub cpu_load: u32,
    pub hdd_workers: Option<u32>,
    pub hdd_bytes: Option<String>,
    pub io_workers: Option<u32>,
    pub vm_workers: Option<u32>,
    /// Absolute (`512M`) or percentage (`80%`) of the memory limit.
    pub vm_bytes: Option<String>,
    pub temp_path: Option<String>,
    pub timeout_secs: u64,
}

impl StressOpts {
    /// Command line of the sidecar.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["stress-ng".to_string()];
        if let Some(workers) = self.cpu_workers {
            args.extend([
                "--cpu".to_string(),
                workers.to_string(),
                "--cpu-load".to_string(),
                self.cpu_load.to_string(),
            ]);
        }
        if let Some(workers) = self.hdd_workers {
            args.extend(["--hdd".to_string(), workers.to_string()]);
            if let Some(bytes) = &self.hdd_bytes {
                args.extend(["--hdd-bytes".to_string(), bytes.clone()]);
            }
        }
        if let Some(workers) = self.io_workers {
            args.extend(["--io".to_string(), workers.to_string()]);
        }
        if let Some(workers) = self.vm_workers {
            args.extend(["--vm".to_string(), workers.to_string()]);
            if let Some(bytes) = &self.vm_bytes {
                args.extend(["--vm-bytes".to_string(), bytes.clone()]);
            }
            args.extend(["--vm-hang".to_string(), "0".to_string()]);
        }
        args.extend(["--timeout".to_string(), format!("{}s", self.timeout_secs)]);
        if let Some(path) = &self.temp_path {
            args.extend(["--temp-path".to_string(), path.clone()]);
        }
        args
    }

    /// Rewrites CPU and memory stressors relative to the target's cgroup.
    ///
    /// Unreadable cgroup files are logged and leave the options unchanged.
    pub fn adapt_to_target(&mut self, reader: &CgroupReader, proc_root: &Path, target: &TargetProcess) {
        if let Some(workers) = self.cpu_workers {
            match reader.cpu_limit_millis(&target.cgroup_path) {
                Ok(limit) => {
                    let cpus = read_cpus_allowed(proc_root, target.pid).unwrap_or_else(|e| {
                        warn!("failed to read allowed cpus of pid {}: {}", target.pid, e);
                        1
                    });
                    let plan = adapt_cpu(limit, cpus, workers, self.cpu_load);
                    self.cpu_workers = Some(plan.workers);
                    self.cpu_load = plan.load;
                }
                Err(e) => warn!("skipping cpu adaptation: {}", e),
            }
        }

        if let (Some(workers), Some(bytes)) = (self.vm_workers, &self.vm_bytes)
            && bytes.ends_with('%')
        {
            match reader.memory_limit_bytes(&target.cgroup_path) {
                Ok(limit) => self.vm_bytes = Some(adapt_vm_bytes(bytes, limit, workers)),
                Err(e) => warn!("skipping memory adaptation: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_args() {
        let opts = StressOpts {
            cpu_workers: Some(1),
            cpu_load: 10,
            timeout_secs: 30,
            ..Default::default()
        };
        assert_eq!(
            opts.args().join(" "),
            "stress-ng --cpu 1 --cpu-load 10 --timeout 30s"
        );
    }

    #[test]
    fn test_vm_and_io_args() {
        let opts = StressOpts {
            hdd_workers: Some(2),
            hdd_bytes: Some("20%".to_string()),
            io_workers: Some(2),
            vm_workers: Some(1),
            vm_bytes: Some("1024K".to_string()),
            temp_path: Some("/tmp".to_string()),
            timeout_secs: 60,
            ..Default::default()
        };
        assert_eq!(
            opts.args().join(" "),
            "stress-ng --hdd 2 --hdd-bytes 20% --io 2 --vm 1 --vm-bytes 1024K --vm-hang 0 --timeout 60s --temp-path /tmp"
        );
    }
}
