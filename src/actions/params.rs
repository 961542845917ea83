//! Typed access to an action's JSON configuration.
//!
//! The orchestrator sends numbers either as JSON numbers or as strings, and
//! lists either as arrays or as comma separated strings; both are accepted.

use crate::error::{Error, Result};
use serde_json::Value;

/// Read-only view of an action configuration object.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a>(&'a Value);

impl<'a> Params<'a> {
    pub fn new(config: &'a Value) -> Self {
        Self(config)
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn invalid(key: &str, value: &Value, expected: &str) -> Error {
        Error::InvalidConfig(format!("parameter '{key}' must be {expected}, got {value}"))
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
                .map(Some)
                .ok_or_else(|| Self::invalid(key, value, "a non-negative number")),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Self::invalid(key, value, "a non-negative number")),
            _ => Err(Self::invalid(key, value, "a non-negative number")),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.u64(key)?.unwrap_or(default))
    }

    /// A number that must fit `u32`.
    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        let value = self.u64_or(key, u64::from(default))?;
        u32::try_from(value)
            .map_err(|_| Error::InvalidConfig(format!("parameter '{key}' is too large: {value}")))
    }

    /// A percentage in `0..=100`.
    pub fn percent_or(&self, key: &str, default: u8) -> Result<u8> {
        let value = self.u64_or(key, u64::from(default))?;
        if value > 100 {
            return Err(Error::InvalidConfig(format!(
                "parameter '{key}' must be between 0 and 100, got {value}"
            )));
        }
        Ok(value as u8)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                "" => Ok(default),
                _ => Err(Self::invalid(key, value, "a boolean")),
            },
            _ => Err(Self::invalid(key, value, "a boolean")),
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(Self::invalid(key, other, "a string")),
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// A list of strings, empty entries dropped.
    pub fn strings(&self, key: &str) -> Result<Vec<String>> {
        let values: Vec<String> = match self.get(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(Self::invalid(key, other, "a list of strings")),
                })
                .collect::<Result<_>>()?,
            Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
            Some(other) => return Err(Self::invalid(key, other, "a list of strings")),
        };
        Ok(values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    /// The attack duration in milliseconds; must be positive.
    pub fn duration_ms(&self) -> Result<u64> {
        match self.u64("duration")? {
            Some(ms) if ms > 0 => Ok(ms),
            _ => Err(Error::InvalidConfig("parameter 'duration' is required".to_string())),
        }
    }

    /// The attack duration rounded up to whole seconds.
    pub fn duration_secs(&self) -> Result<u64> {
        Ok(self.duration_ms()?.div_ceil(1000))
    }
}
