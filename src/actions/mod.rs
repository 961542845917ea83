//! # Attack Actions
//!
//! Every attack implements the same four-step contract consumed by the
//! orchestrator through an external HTTP adapter:
//!
//! ```text
//!   prepare(request) ──► state ──► start(state) ──► status(state)* ──► stop(state)
//!        │                              │                                  │
//!   validate, resolve target,      launch sidecars,                 stop sidecars,
//!   policy gates, adapt limits     register execution               revert, unregister
//! ```
//!
//! State is an opaque JSON value so it can cross the adapter unchanged.
//! Every state carries the `executionId`, which keys the
//! [`ExecutionRegistry`](crate::registry::ExecutionRegistry).
//!
//! ## Catalog
//!
//! | Id suffix                    | Mechanism                              |
//! |------------------------------|----------------------------------------|
//! | `stop`                       | runtime stop in the background         |
//! | `pause`                      | runtime pause, unpause on stop         |
//! | `stress_cpu`/`_mem`/`_io`    | `stress-ng` sidecar                    |
//! | `fill_memory`                | `memfill` sidecar                      |
//! | `fill_disk`                  | `fallocate`/`dd` sidecar               |
//! | `network_*`                  | `ip rule`/`tc` sidecars                |

pub mod context;
pub mod execution;
pub mod fill_disk;
pub mod fill_memory;
pub mod kit;
pub mod network;
pub mod params;
pub mod pause;
pub mod stop_container;
pub mod stress;
pub mod target;

pub use self::context::ActionContext;
pub use self::execution::{Execution, ExecutionKind};
pub use self::kit::ActionKit;

use crate::constants::{ACTION_ID_PREFIX, ATTR_CONTAINER_ID, TARGET_TYPE};
use crate::error::{Error, Result};
use crate::network::{CidrWithPortRange, IpNet, PortRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// =============================================================================
// Requests
// =============================================================================

/// The container an attack is aimed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl TargetRef {
    pub fn container(id: &str) -> Self {
        Self {
            container_id: Some(id.to_string()),
            attributes: BTreeMap::new(),
        }
    }

    /// The explicit container id, else the `container.id` attribute.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .or_else(|| self.attribute(ATTR_CONTAINER_ID))
            .filter(|id| !id.is_empty())
    }

    /// First value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// An endpoint network attacks must never affect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedEndpoint {
    #[serde(default)]
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub port_min: u16,
    #[serde(default)]
    pub port_max: u16,
}

impl RestrictedEndpoint {
    /// Converts to a filter entry; missing ports mean all ports.
    pub fn to_cidr_with_ports(&self) -> Result<CidrWithPortRange> {
        let cidr: IpNet = self.cidr.parse()?;
        let ports = if self.port_min == 0 && self.port_max == 0 {
            PortRange::ALL
        } else {
            PortRange::new(self.port_min.max(1), self.port_max.max(self.port_min))?
        };
        Ok(CidrWithPortRange::new(cidr, ports))
    }
}

/// Input of `prepare`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub execution_id: Uuid,
    #[serde(default)]
    pub target: Option<TargetRef>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub restricted_endpoints: Vec<RestrictedEndpoint>,
}

impl ActionRequest {
    pub fn new(execution_id: Uuid, target: TargetRef, config: Value) -> Self {
        Self {
            execution_id,
            target: Some(target),
            config,
            restricted_endpoints: Vec::new(),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub level: MessageLevel,
    pub message: String,
}

impl Message {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Error,
            message: message.into(),
        }
    }
}

/// `Failed` marks an expected, user-facing outcome; `Errored` a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    Failed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub status: ErrorStatus,
}

impl ActionError {
    pub fn failed(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            status: ErrorStatus::Failed,
        }
    }

    pub fn errored(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            status: ErrorStatus::Errored,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<&Error> for ActionError {
    fn from(e: &Error) -> Self {
        let status = match e {
            Error::HostNetworkRefused(_) | Error::Disallowed { .. } => ErrorStatus::Failed,
            _ => ErrorStatus::Errored,
        };
        Self {
            title: e.to_string(),
            detail: None,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareResult {
    pub state: Value,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl PrepareResult {
    pub fn new<S: Serialize>(state: &S) -> Result<Self> {
        Ok(Self {
            state: serde_json::to_value(state)?,
            messages: Vec::new(),
            error: None,
        })
    }

    /// A prepare that refuses the attack without raising an error.
    pub fn refused(error: ActionError) -> Self {
        Self {
            state: Value::Null,
            messages: Vec::new(),
            error: Some(error),
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartResult {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub completed: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl StatusResult {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn completed() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopResult {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

// =============================================================================
// Description
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Duration,
    Integer,
    Percentage,
    Boolean,
    String,
    StringArray,
    Bitrate,
}

/// One configuration parameter of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub required: bool,
    pub advanced: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Parameter {
    pub fn new(name: &str, label: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            default_value: None,
            required: false,
            advanced: false,
            options: Vec::new(),
        }
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn advanced(mut self) -> Self {
        self.advanced = true;
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    /// The attack duration in milliseconds.
    pub fn duration(default: &str) -> Self {
        Self::new("duration", "Duration", ParameterKind::Duration)
            .default_value(default)
            .required()
    }
}

/// Whether the orchestrator ends the attack after its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeControl {
    External,
    Instantaneous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescription {
    pub id: String,
    pub label: String,
    pub description: String,
    pub category: String,
    pub target_type: String,
    pub time_control: TimeControl,
    pub parameters: Vec<Parameter>,
}

impl ActionDescription {
    pub fn new(suffix: &str, label: &str, description: &str, category: &str) -> Self {
        Self {
            id: action_id(suffix),
            label: label.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            target_type: TARGET_TYPE.to_string(),
            time_control: TimeControl::External,
            parameters: Vec::new(),
        }
    }

    pub fn instantaneous(mut self) -> Self {
        self.time_control = TimeControl::Instantaneous;
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// Full action id for a catalog suffix.
pub fn action_id(suffix: &str) -> String {
    format!("{ACTION_ID_PREFIX}.{suffix}")
}

// =============================================================================
// Action Trait
// =============================================================================

/// Part of every state: the execution it belongs to.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionRef {
    execution_id: Uuid,
}

/// Reads the execution id from an action state.
pub fn execution_id_of(state: &Value) -> Result<Uuid> {
    let r: ExecutionRef = serde_json::from_value(state.clone())?;
    Ok(r.execution_id)
}

/// An attack with the prepare/start/status/stop contract.
///
/// # Contract
///
/// - `prepare` has no side effects on the target. Policy refusals are
///   returned as a [`PrepareResult`] carrying a `Failed` error.
/// - `start` either registers a running execution or fails with nothing
///   left behind.
/// - `status` never blocks on the target; an execution that is no longer
///   registered reports completed.
/// - `stop` is idempotent.
#[async_trait]
pub trait Action: Send + Sync {
    /// Full action id.
    fn id(&self) -> String {
        self.describe().id
    }

    fn describe(&self) -> ActionDescription;

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult>;

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult>;

    async fn status(&self, ctx: &ActionContext, state: &Value) -> Result<StatusResult> {
        ctx.execution_status(execution_id_of(state)?).await
    }

    async fn stop(&self, ctx: &ActionContext, state: &Value) -> Result<StopResult> {
        ctx.stop_execution(execution_id_of(state)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_ref_container_id() {
        let mut target = TargetRef::default();
        assert_eq!(target.container_id(), None);
        target
            .attributes
            .insert("container.id".to_string(), vec!["containerd://abc".to_string()]);
        assert_eq!(target.container_id(), Some("containerd://abc"));
        target.container_id = Some("docker://def".to_string());
        assert_eq!(target.container_id(), Some("docker://def"));
    }

    #[test]
    fn test_restricted_endpoint() {
        let ep = RestrictedEndpoint {
            name: "api".to_string(),
            cidr: "10.0.0.1/32".to_string(),
            port_min: 443,
            port_max: 443,
        };
        let entry = ep.to_cidr_with_ports().unwrap();
        assert_eq!(entry.to_string(), "10.0.0.1/32:443");

        let all = RestrictedEndpoint {
            port_min: 0,
            port_max: 0,
            ..ep
        };
        assert!(all.to_cidr_with_ports().unwrap().ports.is_all());
    }

    #[test]
    fn test_execution_id_of() {
        let id = Uuid::new_v4();
        let state = json!({"executionId": id, "other": 1});
        assert_eq!(execution_id_of(&state).unwrap(), id);
        assert!(execution_id_of(&json!({})).is_err());
    }

    #[test]
    fn test_action_error_status() {
        let e = ActionError::from(&Error::HostNetworkRefused("abc".to_string()));
        assert_eq!(e.status, ErrorStatus::Failed);
        let e = ActionError::from(&Error::TargetNotFound("abc".to_string()));
        assert_eq!(e.status, ErrorStatus::Errored);
    }

    #[test]
    fn test_request_deserialize() {
        let req: ActionRequest = serde_json::from_value(json!({
            "executionId": "00000000-0000-0000-0000-000000000001",
            "target": {"attributes": {"container.id": ["docker://abc"]}},
            "config": {"duration": 1000}
        }))
        .unwrap();
        assert_eq!(req.target.unwrap().container_id(), Some("docker://abc"));
        assert!(req.restricted_endpoints.is_empty());
    }
}
