//! Disk usage of a target mount, read with `df -Pk`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Capacity figures of one filesystem, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub capacity_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
}

impl DiskUsage {
    /// Used share of the capacity in percent.
    pub fn used_percent(&self) -> u64 {
        if self.capacity_kb == 0 {
            return 0;
        }
        self.used_kb * 100 / self.capacity_kb
    }
}

/// Parses POSIX `df -Pk` output for a single path.
///
/// ```text
/// Filesystem     1024-blocks     Used Available Capacity Mounted on
/// overlay           61255492 23455012  34659456      41% /
/// ```
pub fn parse_df(output: &str) -> Result<DiskUsage> {
    let line = output
        .lines()
        .skip(1)
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::Internal(format!("unexpected df output: '{}'", output.trim())))?;

    // The filesystem column may contain spaces; count from the right.
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 6 {
        return Err(Error::Internal(format!("unexpected df line: '{line}'")));
    }
    let n = cols.len();
    let field = |i: usize, name: &str| -> Result<u64> {
        cols[i]
            .parse()
            .map_err(|e| Error::Internal(format!("invalid {name} '{}' in df output: {e}", cols[i])))
    };
    Ok(DiskUsage {
        capacity_kb: field(n - 5, "capacity")?,
        used_kb: field(n - 4, "used")?,
        available_kb: field(n - 3, "available")?,
    })
}
