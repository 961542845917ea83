//! Network attacks.
//!
//! | Action                        | Implementation                  |
//! |-------------------------------|---------------------------------|
//! | `network_blackhole`           | `ip rule ... blackhole`         |
//! | `network_block_dns`           | `ip rule ... blackhole dport N` |
//! | `network_delay`               | `tc netem delay`                |
//! | `network_package_loss`        | `tc netem loss`                 |
//! | `network_package_corruption`  | `tc netem corrupt`              |
//! | `network_bandwidth`           | `tc tbf rate`                   |
//!
//! Prepare resolves hostnames inside the target and, for `tc` variants,
//! picks the interfaces. The network namespace is only checked there; it is
//! claimed when the fault is applied in start.

use super::execution::{Execution, ExecutionKind};
use super::params::Params;
use super::target::{ResolvedTarget, host_network_refusal, resolve_target};
use super::{
    Action, ActionContext, ActionDescription, ActionRequest, Message, Parameter, ParameterKind,
    PrepareResult, StartResult,
};
use crate::error::{Error, Result};
use crate::introspect::NamespaceKind;
use crate::network::{Filter, NetworkOpts, validate_rate};
use crate::sidecar::SidecarOpts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Share of the delay used as jitter when jitter is enabled.
const JITTER_PERCENT: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Blackhole,
    Delay,
    PackageLoss,
    PackageCorruption,
    Bandwidth,
    BlockDns,
}

impl NetworkKind {
    pub const ALL: [NetworkKind; 6] = [
        Self::Blackhole,
        Self::Delay,
        Self::PackageLoss,
        Self::PackageCorruption,
        Self::Bandwidth,
        Self::BlockDns,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Self::Blackhole => "network_blackhole",
            Self::Delay => "network_delay",
            Self::PackageLoss => "network_package_loss",
            Self::PackageCorruption => "network_package_corruption",
            Self::Bandwidth => "network_bandwidth",
            Self::BlockDns => "network_block_dns",
        }
    }

    fn uses_tc(&self) -> bool {
        !matches!(self, Self::Blackhole | Self::BlockDns)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkState {
    execution_id: Uuid,
    container_id: String,
    sidecar: SidecarOpts,
    network: NetworkOpts,
}

pub struct NetworkAttack {
    kind: NetworkKind,
}

impl NetworkAttack {
    pub fn new(kind: NetworkKind) -> Self {
        Self { kind }
    }

    /// Attack options without filter and interfaces.
    fn options(&self, config: &Value, filter: Filter) -> Result<NetworkOpts> {
        let params = Params::new(config);
        Ok(match self.kind {
            NetworkKind::Blackhole => NetworkOpts::Blackhole { filter },
            NetworkKind::Delay => {
                let delay_ms = params.u64_or("networkDelay", 500)?;
                let jitter_ms = if params.bool_or("networkDelayJitter", false)? {
                    delay_ms * JITTER_PERCENT / 100
                } else {
                    0
                };
                NetworkOpts::Delay {
                    filter,
                    delay_ms,
                    jitter_ms,
                    interfaces: Vec::new(),
                    tcp_psh_only: params.bool_or("tcpDataPacketsOnly", false)?,
                }
            }
            NetworkKind::PackageLoss => NetworkOpts::PackageLoss {
                filter,
                loss_percent: params.percent_or("networkLoss", 70)?,
                interfaces: Vec::new(),
            },
            NetworkKind::PackageCorruption => NetworkOpts::PackageCorruption {
                filter,
                corrupt_percent: params.percent_or("networkCorruption", 15)?,
                interfaces: Vec::new(),
            },
            NetworkKind::Bandwidth => {
                let rate = params.string_or("bandwidth", "1024kbit")?;
                validate_rate(&rate)?;
                NetworkOpts::Bandwidth {
                    filter,
                    rate,
                    interfaces: Vec::new(),
                }
            }
            NetworkKind::BlockDns => {
                let port = params.u64_or("dnsPort", 53)?;
                let port = u16::try_from(port)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| Error::InvalidConfig(format!("invalid dns port {port}")))?;
                NetworkOpts::BlockDns { port }
            }
        })
    }

    async fn filter(&self, ctx: &ActionContext, request: &ActionRequest, target: &ResolvedTarget) -> Result<Filter> {
        if self.kind == NetworkKind::BlockDns {
            return Ok(Filter::default());
        }
        let params = Params::new(&request.config);
        let hostnames = params.strings("hostname")?;
        let resolved = if hostnames.is_empty() {
            Vec::new()
        } else {
            ctx.resolver.resolve(&target.sidecar, &hostnames).await?
        };
        let restricted = request
            .restricted_endpoints
            .iter()
            .map(|e| e.to_cidr_with_ports())
            .collect::<Result<Vec<_>>>()?;
        Filter::from_config(
            &params.strings("ip")?,
            &resolved,
            &params.strings("port")?,
            &restricted,
            &ctx.agent_ips,
            ctx.config.port,
            ctx.config.health_port,
        )
    }

    async fn interfaces(&self, ctx: &ActionContext, config: &Value, target: &ResolvedTarget) -> Result<Vec<String>> {
        let requested = Params::new(config).strings("networkInterface")?;
        if !requested.is_empty() {
            return Ok(requested);
        }
        let found: Vec<String> = ctx
            .network
            .list_interfaces(&target.sidecar)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        if found.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no network interfaces found in container {}",
                target.container.id
            )));
        }
        debug!(container = %target.container.id, "shaping interfaces {:?}", found);
        Ok(found)
    }
}

fn common_parameters(description: ActionDescription) -> ActionDescription {
    description
        .parameter(Parameter::duration("30000"))
        .parameter(
            Parameter::new("failOnHostNetwork", "Fail on Host Network", ParameterKind::Boolean)
                .default_value("true")
                .advanced(),
        )
}

fn filter_parameters(description: ActionDescription) -> ActionDescription {
    description
        .parameter(Parameter::new("hostname", "Hostname", ParameterKind::StringArray))
        .parameter(Parameter::new("ip", "IP Address/CIDR", ParameterKind::StringArray))
        .parameter(Parameter::new("port", "Ports", ParameterKind::StringArray))
}

#[async_trait]
impl Action for NetworkAttack {
    fn describe(&self) -> ActionDescription {
        let d = match self.kind {
            NetworkKind::Blackhole => ActionDescription::new(
                self.kind.suffix(),
                "Block Traffic",
                "Blocks network traffic (incoming and outgoing).",
                "network",
            ),
            NetworkKind::Delay => ActionDescription::new(
                self.kind.suffix(),
                "Delay Traffic",
                "Injects latency into egress network traffic.",
                "network",
            )
            .parameter(
                Parameter::new("networkDelay", "Network Delay", ParameterKind::Duration)
                    .default_value("500")
                    .required(),
            )
            .parameter(
                Parameter::new("networkDelayJitter", "Jitter", ParameterKind::Boolean)
                    .default_value("false"),
            )
            .parameter(
                Parameter::new("tcpDataPacketsOnly", "TCP Data Packets Only", ParameterKind::Boolean)
                    .default_value("false")
                    .advanced(),
            ),
            NetworkKind::PackageLoss => ActionDescription::new(
                self.kind.suffix(),
                "Drop Outgoing Traffic",
                "Causes packet loss for outgoing network traffic (egress).",
                "network",
            )
            .parameter(
                Parameter::new("networkLoss", "Network Loss", ParameterKind::Percentage)
                    .default_value("70")
                    .required(),
            ),
            NetworkKind::PackageCorruption => ActionDescription::new(
                self.kind.suffix(),
                "Corrupt Outgoing Packages",
                "Injects corrupted packets by introducing single bit errors (egress).",
                "network",
            )
            .parameter(
                Parameter::new("networkCorruption", "Package Corruption", ParameterKind::Percentage)
                    .default_value("15")
                    .required(),
            ),
            NetworkKind::Bandwidth => ActionDescription::new(
                self.kind.suffix(),
                "Limit Bandwidth",
                "Limits the available egress network bandwidth.",
                "network",
            )
            .parameter(
                Parameter::new("bandwidth", "Network Bandwidth", ParameterKind::Bitrate)
                    .default_value("1024kbit")
                    .required(),
            ),
            NetworkKind::BlockDns => ActionDescription::new(
                self.kind.suffix(),
                "Block DNS",
                "Blocks access to DNS servers.",
                "network",
            )
            .parameter(
                Parameter::new("dnsPort", "DNS Port", ParameterKind::Integer)
                    .default_value("53")
                    .required(),
            ),
        };
        let d = common_parameters(d);
        let d = if self.kind == NetworkKind::BlockDns {
            d
        } else {
            filter_parameters(d)
        };
        if self.kind.uses_tc() {
            d.parameter(
                Parameter::new("networkInterface", "Network Interface", ParameterKind::StringArray)
                    .advanced(),
            )
        } else {
            d
        }
    }

    async fn prepare(&self, ctx: &ActionContext, request: &ActionRequest) -> Result<PrepareResult> {
        let params = Params::new(&request.config);
        params.duration_ms()?;
        let fail_on_host_network = params.bool_or("failOnHostNetwork", true)?;
        // Validates the attack parameters before anything touches the target.
        self.options(&request.config, Filter::default())?;

        let target = resolve_target(ctx, request).await?;
        if let Some(refusal) = host_network_refusal(ctx, &target, fail_on_host_network) {
            info!(container = %target.container.id, "refusing network attack on host network");
            return Ok(PrepareResult::refused(refusal));
        }
        let inode = target
            .process
            .net_inode()
            .ok_or_else(|| Error::NamespaceUnavailable {
                kind: NamespaceKind::Net.to_string(),
                pid: target.process.pid,
            })?;
        ctx.network.check_available(inode)?;

        let filter = self.filter(ctx, request, &target).await?;
        let mut network = self.options(&request.config, filter)?;
        if self.kind.uses_tc() {
            network.set_interfaces(self.interfaces(ctx, &request.config, &target).await?);
        }

        PrepareResult::new(&NetworkState {
            execution_id: request.execution_id,
            container_id: target.container.id,
            sidecar: target.sidecar,
            network,
        })
    }

    async fn start(&self, ctx: &ActionContext, state: &Value) -> Result<StartResult> {
        let state: NetworkState = serde_json::from_value(state.clone())?;
        ctx.start_execution(state.execution_id, async {
            let applied = ctx.network.apply(&state.sidecar, &state.network).await?;
            let execution = Execution::new(state.execution_id, ExecutionKind::Network(Box::new(applied)));
            let result = StartResult {
                messages: vec![Message::info(format!(
                    "applied {} to container {}",
                    state.network, state.container_id
                ))],
                error: None,
            };
            Ok((execution, result))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delay_options() {
        let attack = NetworkAttack::new(NetworkKind::Delay);
        let opts = attack
            .options(
                &json!({"networkDelay": 200, "networkDelayJitter": true, "tcpDataPacketsOnly": "true"}),
                Filter::default(),
            )
            .unwrap();
        let NetworkOpts::Delay {
            delay_ms,
            jitter_ms,
            tcp_psh_only,
            ..
        } = opts
        else {
            panic!("expected delay");
        };
        assert_eq!(delay_ms, 200);
        assert_eq!(jitter_ms, 60);
        assert!(tcp_psh_only);
    }

    #[test]
    fn test_defaults() {
        let opts = NetworkAttack::new(NetworkKind::PackageLoss)
            .options(&json!({}), Filter::default())
            .unwrap();
        assert!(matches!(opts, NetworkOpts::PackageLoss { loss_percent: 70, .. }));

        let opts = NetworkAttack::new(NetworkKind::BlockDns)
            .options(&json!({}), Filter::default())
            .unwrap();
        assert_eq!(opts, NetworkOpts::BlockDns { port: 53 });
    }

    #[test]
    fn test_invalid_options() {
        let bandwidth = NetworkAttack::new(NetworkKind::Bandwidth);
        assert!(bandwidth.options(&json!({"bandwidth": "fast"}), Filter::default()).is_err());
        let dns = NetworkAttack::new(NetworkKind::BlockDns);
        assert!(dns.options(&json!({"dnsPort": 70000}), Filter::default()).is_err());
        let loss = NetworkAttack::new(NetworkKind::PackageLoss);
        assert!(loss.options(&json!({"networkLoss": 120}), Filter::default()).is_err());
    }

    #[test]
    fn test_descriptions() {
        for kind in NetworkKind::ALL {
            let d = NetworkAttack::new(kind).describe();
            assert!(d.id.ends_with(kind.suffix()));
            let has_interface = d.parameters.iter().any(|p| p.name == "networkInterface");
            assert_eq!(has_interface, kind.uses_tc());
        }
    }
}
