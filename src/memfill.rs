//! Fill-memory invocation.
//!
//! The host's `memfill` binary is mounted read-only into the sidecar and
//! called as `memfill <size> <mode> <duration>`.

use crate::constants::MEMFILL_MOUNTPOINT;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the size is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemfillMode {
    /// Allocate until the cgroup usage reaches the size.
    Usage,
    /// Allocate the size on top of the current usage.
    Absolute,
}

impl MemfillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Absolute => "absolute",
        }
    }
}

impl FromStr for MemfillMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usage" => Ok(Self::Usage),
            "absolute" => Ok(Self::Absolute),
            other => Err(Error::InvalidConfig(format!("unknown fill memory mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemfillUnit {
    Percent,
    Megabytes,
}

impl FromStr for MemfillUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percent" | "%" => Ok(Self::Percent),
            "megabytes" | "mib" | "mb" => Ok(Self::Megabytes),
            other => Err(Error::InvalidConfig(format!("unknown fill memory unit '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemfillOpts {
    pub size: u64,
    pub unit: MemfillUnit,
    pub mode: MemfillMode,
    pub duration_secs: u64,
}

impl MemfillOpts {
    /// Size argument; percentages become megabytes when the limit is known.
    pub fn size_arg(&self, limit_bytes: Option<u64>) -> String {
        match (self.unit, limit_bytes) {
            (MemfillUnit::Megabytes, _) => format!("{}M", self.size),
            (MemfillUnit::Percent, Some(limit)) => {
                format!("{}M", limit * self.size / 100 / (1024 * 1024))
            }
            (MemfillUnit::Percent, None) => format!("{}%", self.size),
        }
    }

    /// Command line of the sidecar.
    pub fn args(&self, limit_bytes: Option<u64>) -> Vec<String> {
        vec![
            MEMFILL_MOUNTPOINT.to_string(),
            self.size_arg(limit_bytes),
            self.mode.as_str().to_string(),
            format!("{}s", self.duration_secs),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: u64, unit: MemfillUnit) -> MemfillOpts {
        MemfillOpts {
            size,
            unit,
            mode: MemfillMode::Usage,
            duration_secs: 30,
        }
    }

    #[test]
    fn test_percent_with_limit() {
        let o = opts(50, MemfillUnit::Percent);
        assert_eq!(o.args(Some(512 * 1024 * 1024)), vec!["/memfill", "256M", "usage", "30s"]);
    }

    #[test]
    fn test_percent_without_limit() {
        assert_eq!(opts(80, MemfillUnit::Percent).size_arg(None), "80%");
    }

    #[test]
    fn test_megabytes() {
        assert_eq!(opts(100, MemfillUnit::Megabytes).size_arg(Some(1)), "100M");
    }

    #[test]
    fn test_parse() {
        assert_eq!("ABSOLUTE".parse::<MemfillMode>().unwrap(), MemfillMode::Absolute);
        assert_eq!("percent".parse::<MemfillUnit>().unwrap(), MemfillUnit::Percent);
        assert!("lots".parse::<MemfillUnit>().is_err());
    }
}
