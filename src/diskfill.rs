//! Fill-disk sizing and commands.
//!
//! The target's temp path is bind-mounted into the sidecar at
//! [`DISK_FILL_MOUNTPOINT`]; every command operates on that mountpoint.
//!
//! | Mode         | Size to write (MiB)                           |
//! |--------------|-----------------------------------------------|
//! | `Percentage` | `(capacity * size / 100 - used) / 1024`       |
//! | `MbLeft`     | `available / 1024 - size`                     |
//! | `MbToFill`   | `size`                                        |

use crate::constants::{DISK_FILL_FILE, DISK_FILL_MOUNTPOINT};
use crate::diskusage::DiskUsage;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskFillMode {
    Percentage,
    MbToFill,
    MbLeft,
}

impl FromStr for DiskFillMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PERCENTAGE" => Ok(Self::Percentage),
            "MB_TO_FILL" => Ok(Self::MbToFill),
            "MB_LEFT" => Ok(Self::MbLeft),
            other => Err(Error::InvalidConfig(format!("unknown fill disk mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskFillMethod {
    /// `fallocate` in one go.
    AtOnce,
    /// `dd` writing blocks with direct I/O.
    OverTime,
}

impl FromStr for DiskFillMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AT_ONCE" => Ok(Self::AtOnce),
            "OVER_TIME" => Ok(Self::OverTime),
            other => Err(Error::InvalidConfig(format!("unknown fill disk method '{other}'"))),
        }
    }
}

/// Parameters of a fill-disk attack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskFillOpts {
    /// Directory inside the target to fill.
    pub temp_path: String,
    pub mode: DiskFillMode,
    pub size: u64,
    pub block_size_mb: u64,
    pub method: DiskFillMethod,
}

impl DiskFillOpts {
    /// Returns true if sizing depends on the current disk usage.
    pub fn needs_usage(&self) -> bool {
        self.mode != DiskFillMode::MbToFill
    }

    /// Megabytes to write; zero or negative means nothing to do.
    pub fn size_to_fill_mb(&self, usage: Option<&DiskUsage>) -> Result<i64> {
        let size = i64::try_from(self.size)
            .map_err(|_| Error::InvalidConfig(format!("size {} too large", self.size)))?;
        if self.mode == DiskFillMode::MbToFill {
            return Ok(size);
        }
        let usage = usage.ok_or_else(|| {
            Error::Internal("disk usage required to compute the fill size".to_string())
        })?;
        let capacity = to_i64(usage.capacity_kb);
        let used = to_i64(usage.used_kb);
        let available = to_i64(usage.available_kb);
        Ok(match self.mode {
            DiskFillMode::Percentage => (capacity * size / 100 - used) / 1024,
            DiskFillMode::MbLeft => available / 1024 - size,
            DiskFillMode::MbToFill => size,
        })
    }

    /// Command line writing `size_mb` into the fill file.
    pub fn fill_args(&self, size_mb: u64) -> Vec<String> {
        let file = fill_file();
        match self.method {
            DiskFillMethod::AtOnce => vec![
                "fallocate".to_string(),
                "-l".to_string(),
                format!("{size_mb}M"),
                file,
            ],
            DiskFillMethod::OverTime => {
                let block = self.block_size_mb.clamp(1, size_mb.max(1));
                vec![
                    "dd".to_string(),
                    "if=/dev/zero".to_string(),
                    format!("of={file}"),
                    format!("bs={block}M"),
                    format!("count={}", size_mb / block),
                    "oflag=direct".to_string(),
                ]
            }
        }
    }
}

fn to_i64(kb: u64) -> i64 {
    i64::try_from(kb).unwrap_or(i64::MAX)
}

/// Path of the fill file inside the sidecar.
pub fn fill_file() -> String {
    format!("{DISK_FILL_MOUNTPOINT}/{DISK_FILL_FILE}")
}

/// Command line reading the usage of the mounted path.
pub fn df_args() -> Vec<String> {
    vec!["df".to_string(), "-Pk".to_string(), DISK_FILL_MOUNTPOINT.to_string()]
}

/// Command line removing the fill file.
pub fn cleanup_args() -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), fill_file()]
}

/// Command line of a sidecar that does nothing.
pub fn noop_args() -> Vec<String> {
    vec!["true".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(mode: DiskFillMode, size: u64, method: DiskFillMethod) -> DiskFillOpts {
        DiskFillOpts {
            temp_path: "/tmp".to_string(),
            mode,
            size,
            block_size_mb: 5,
            method,
        }
    }

    fn usage() -> DiskUsage {
        DiskUsage {
            capacity_kb: 10 * 1024 * 1024,
            used_kb: 4 * 1024 * 1024,
            available_kb: 6 * 1024 * 1024,
        }
    }

    #[test]
    fn test_percentage_size() {
        let o = opts(DiskFillMode::Percentage, 80, DiskFillMethod::AtOnce);
        assert_eq!(o.size_to_fill_mb(Some(&usage())).unwrap(), 4096);
        let o = opts(DiskFillMode::Percentage, 30, DiskFillMethod::AtOnce);
        assert!(o.size_to_fill_mb(Some(&usage())).unwrap() <= 0);
    }

    #[test]
    fn test_mb_left_and_to_fill() {
        let o = opts(DiskFillMode::MbLeft, 1024, DiskFillMethod::AtOnce);
        assert_eq!(o.size_to_fill_mb(Some(&usage())).unwrap(), 5120);
        let o = opts(DiskFillMode::MbToFill, 1024, DiskFillMethod::AtOnce);
        assert!(!o.needs_usage());
        assert_eq!(o.size_to_fill_mb(None).unwrap(), 1024);
    }

    #[test]
    fn test_fill_args() {
        let o = opts(DiskFillMode::MbToFill, 1024, DiskFillMethod::AtOnce);
        assert_eq!(
            o.fill_args(1024).join(" "),
            "fallocate -l 1024M /disk-fill-temp/disk-fill"
        );
        let o = opts(DiskFillMode::MbToFill, 1024, DiskFillMethod::OverTime);
        assert_eq!(
            o.fill_args(1024).join(" "),
            "dd if=/dev/zero of=/disk-fill-temp/disk-fill bs=5M count=204 oflag=direct"
        );
    }

    #[test]
    fn test_block_size_larger_than_size() {
        let o = opts(DiskFillMode::MbToFill, 3, DiskFillMethod::OverTime);
        assert_eq!(
            o.fill_args(3).join(" "),
            "dd if=/dev/zero of=/disk-fill-temp/disk-fill bs=3M count=1 oflag=direct"
        );
    }

    #[test]
    fn test_parse_mode_and_method() {
        assert_eq!("MB_LEFT".parse::<DiskFillMode>().unwrap(), DiskFillMode::MbLeft);
        assert_eq!("over_time".parse::<DiskFillMethod>().unwrap(), DiskFillMethod::OverTime);
        assert!("HALF".parse::<DiskFillMode>().is_err());
    }
}
