//! # Network Attacks
//!
//! Network faults are expressed as a [`NetworkOpts`] value and compiled into
//! command streams that run inside the target's network namespace:
//!
//! | Variant              | Tool      | Mechanism                                  |
//! |----------------------|-----------|--------------------------------------------|
//! | `Blackhole`          | `ip rule` | blackhole rules, excludes routed via main  |
//! | `BlockDns`           | `ip rule` | blackhole on the DNS port                  |
//! | `Delay`              | `tc`      | `prio` root + `netem delay` on band `1:3`  |
//! | `PackageLoss`        | `tc`      | `prio` root + `netem loss` on band `1:3`   |
//! | `PackageCorruption`  | `tc`      | `prio` root + `netem corrupt` on band `1:3`|
//! | `Bandwidth`          | `tc`      | `prio` root + `tbf` on band `1:3`          |
//!
//! Every add stream has an exact inverse produced by the same compiler in
//! [`Mode::Delete`]. The compilers are pure; [`manager::NetworkManager`]
//! runs the streams in sidecars and guards the namespace.

pub mod ip;
pub mod manager;
pub mod ports;
pub mod resolve;
pub mod tc;

pub use self::ip::ip_rule_commands;
pub use self::manager::{AppliedNetwork, Batch, Interface, NetNsGuard, NetworkManager, Tool};
pub use self::ports::{PortMask, port_masks};
pub use self::resolve::HostnameResolver;
pub use self::tc::tc_commands;

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

// =============================================================================
// Addresses
// =============================================================================

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family flag of the `ip` tool.
    pub fn ip_flag(&self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }

    /// Protocol name used by `tc filter ... protocol`.
    pub fn tc_protocol(&self) -> &'static str {
        match self {
            Self::V4 => "ip",
            Self::V6 => "ipv6",
        }
    }

    /// Selector prefix of the u32 classifier.
    pub fn u32_selector(&self) -> &'static str {
        match self {
            Self::V4 => "ip",
            Self::V6 => "ip6",
        }
    }

    fn max_prefix(&self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

/// An IP network in CIDR notation, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let family = family_of(&addr);
        if prefix > family.max_prefix() {
            return Err(Error::InvalidConfig(format!(
                "invalid prefix length {prefix} for {addr}"
            )));
        }
        let addr = match addr {
            IpAddr::V4(a) => {
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                IpAddr::V4(Ipv4Addr::from(u32::from(a) & mask))
            }
            IpAddr::V6(a) => {
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                IpAddr::V6(Ipv6Addr::from(u128::from(a) & mask))
            }
        };
        Ok(Self { addr, prefix })
    }

    /// Network containing exactly `addr`.
    pub fn host(addr: IpAddr) -> Self {
        let prefix = family_of(&addr).max_prefix();
        Self { addr, prefix }
    }

    /// `0.0.0.0/0` or `::/0`.
    pub fn any(family: Family) -> Self {
        let addr = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self { addr, prefix: 0 }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn family(&self) -> Family {
        family_of(&self.addr)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 { 0 } else { u32::MAX << (32 - self.prefix) };
                u32::from(ip) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - self.prefix) };
                u128::from(ip) & mask == u128::from(net)
            }
            _ => false,
        }
    }
}

fn family_of(addr: &IpAddr) -> Family {
    match addr {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::InvalidConfig(format!("invalid ip or cidr '{s}'"));
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Self::new(addr, prefix)
            }
            None => Ok(Self::host(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    /// Default range of network attacks.
    pub const ALL: PortRange = PortRange { from: 1, to: 65534 };

    pub fn new(from: u16, to: u16) -> Result<Self> {
        if from == 0 || from > to {
            return Err(Error::InvalidConfig(format!("invalid port range {from}-{to}")));
        }
        Ok(Self { from, to })
    }

    pub fn single(port: u16) -> Result<Self> {
        Self::new(port, port)
    }

    /// Returns true for the default range, which is matched without a port selector.
    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidConfig(format!("invalid port '{s}'")))
        };
        match s.split_once('-') {
            Some((from, to)) => Self::new(parse(from)?, parse(to)?),
            None => Self::single(parse(s)?),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

/// A network combined with a port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CidrWithPortRange {
    pub cidr: IpNet,
    pub ports: PortRange,
}

impl CidrWithPortRange {
    pub fn new(cidr: IpNet, ports: PortRange) -> Self {
        Self { cidr, ports }
    }

    pub fn matches(&self, ip: IpAddr, port: u16) -> bool {
        self.cidr.contains(ip) && self.ports.contains(port)
    }
}

impl fmt::Display for CidrWithPortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cidr, self.ports)
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Which traffic a network attack affects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub include: Vec<CidrWithPortRange>,
    pub exclude: Vec<CidrWithPortRange>,
}

impl Filter {
    /// Builds the filter of a network attack.
    ///
    /// `ips` and `resolved` (addresses of the requested hostnames) select the
    /// affected peers; both empty means every peer. `ports` defaults to
    /// [`PortRange::ALL`]. Restricted endpoints and the agent's own
    /// addresses on `port` and `health_port` are always excluded.
    pub fn from_config(
        ips: &[String],
        resolved: &[IpAddr],
        ports: &[String],
        restricted: &[CidrWithPortRange],
        agent_ips: &[IpAddr],
        port: u16,
        health_port: u16,
    ) -> Result<Self> {
        let mut cidrs = ips
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<IpNet>())
            .collect::<Result<Vec<_>>>()?;
        cidrs.extend(resolved.iter().map(|ip| IpNet::host(*ip)));
        if cidrs.is_empty() {
            cidrs = vec![IpNet::any(Family::V4), IpNet::any(Family::V6)];
        }

        let mut ranges = ports
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<PortRange>())
            .collect::<Result<Vec<_>>>()?;
        if ranges.is_empty() {
            ranges.push(PortRange::ALL);
        }

        let mut filter = Filter::default();
        for cidr in &cidrs {
            for ports in &ranges {
                push_unique(&mut filter.include, CidrWithPortRange::new(*cidr, *ports));
            }
        }

        for endpoint in restricted {
            push_unique(&mut filter.exclude, *endpoint);
        }
        for ip in agent_ips {
            for p in [port, health_port] {
                if let Ok(ports) = PortRange::single(p) {
                    push_unique(
                        &mut filter.exclude,
                        CidrWithPortRange::new(IpNet::host(*ip), ports),
                    );
                }
            }
        }
        Ok(filter)
    }

    pub fn includes_of(&self, family: Family) -> impl Iterator<Item = &CidrWithPortRange> {
        self.include.iter().filter(move |e| e.cidr.family() == family)
    }

    pub fn excludes_of(&self, family: Family) -> impl Iterator<Item = &CidrWithPortRange> {
        self.exclude.iter().filter(move |e| e.cidr.family() == family)
    }

    /// Returns true if traffic between the container and `peer:port` is affected.
    pub fn affects(&self, peer: IpAddr, port: u16) -> bool {
        !self.exclude.iter().any(|e| e.matches(peer, port))
            && self.include.iter().any(|e| e.matches(peer, port))
    }
}

fn push_unique(list: &mut Vec<CidrWithPortRange>, entry: CidrWithPortRange) {
    if !list.contains(&entry) {
        list.push(entry);
    }
}

/// Addresses of the host interfaces, loopback excluded.
pub fn agent_ips() -> Vec<IpAddr> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("failed to list interface addresses: {}", e);
            return Vec::new();
        }
    };
    let mut ips = Vec::new();
    for ifaddr in addrs {
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if !ip.is_loopback() && !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}

// =============================================================================
// Attack Options
// =============================================================================

/// Direction of a compiled command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Add,
    Delete,
}

/// A network fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkOpts {
    Blackhole {
        filter: Filter,
    },
    Delay {
        filter: Filter,
        delay_ms: u64,
        jitter_ms: u64,
        interfaces: Vec<String>,
        tcp_psh_only: bool,
    },
    PackageLoss {
        filter: Filter,
        loss_percent: u8,
        interfaces: Vec<String>,
    },
    PackageCorruption {
        filter: Filter,
        corrupt_percent: u8,
        interfaces: Vec<String>,
    },
    Bandwidth {
        filter: Filter,
        rate: String,
        interfaces: Vec<String>,
    },
    BlockDns {
        port: u16,
    },
}

impl NetworkOpts {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blackhole { .. } => "blackhole",
            Self::Delay { .. } => "delay",
            Self::PackageLoss { .. } => "package_loss",
            Self::PackageCorruption { .. } => "package_corruption",
            Self::Bandwidth { .. } => "bandwidth",
            Self::BlockDns { .. } => "block_dns",
        }
    }

    /// Returns true for variants implemented with `ip rule`.
    pub fn uses_ip_rules(&self) -> bool {
        matches!(self, Self::Blackhole { .. } | Self::BlockDns { .. })
    }

    /// The traffic selection, with block-dns expanded to its port on all peers.
    pub fn filter(&self) -> Filter {
        match self {
            Self::Blackhole { filter }
            | Self::Delay { filter, .. }
            | Self::PackageLoss { filter, .. }
            | Self::PackageCorruption { filter, .. }
            | Self::Bandwidth { filter, .. } => filter.clone(),
            Self::BlockDns { port } => {
                let mut filter = Filter::default();
                if let Ok(ports) = PortRange::single(*port) {
                    for family in [Family::V4, Family::V6] {
                        filter
                            .include
                            .push(CidrWithPortRange::new(IpNet::any(family), ports));
                    }
                }
                filter
            }
        }
    }

    /// Interfaces shaped by `tc` variants.
    pub fn interfaces(&self) -> &[String] {
        match self {
            Self::Delay { interfaces, .. }
            | Self::PackageLoss { interfaces, .. }
            | Self::PackageCorruption { interfaces, .. }
            | Self::Bandwidth { interfaces, .. } => interfaces,
            Self::Blackhole { .. } | Self::BlockDns { .. } => &[],
        }
    }

    /// Replaces the interface list of `tc` variants.
    pub fn set_interfaces(&mut self, names: Vec<String>) {
        match self {
            Self::Delay { interfaces, .. }
            | Self::PackageLoss { interfaces, .. }
            | Self::PackageCorruption { interfaces, .. }
            | Self::Bandwidth { interfaces, .. } => *interfaces = names,
            Self::Blackhole { .. } | Self::BlockDns { .. } => {}
        }
    }
}

impl fmt::Display for NetworkOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blackhole { filter } => write!(f, "blackhole ({} includes)", filter.include.len()),
            Self::Delay {
                delay_ms, jitter_ms, ..
            } => write!(f, "delay {delay_ms}ms jitter {jitter_ms}ms"),
            Self::PackageLoss { loss_percent, .. } => write!(f, "package loss {loss_percent}%"),
            Self::PackageCorruption {
                corrupt_percent, ..
            } => write!(f, "package corruption {corrupt_percent}%"),
            Self::Bandwidth { rate, .. } => write!(f, "bandwidth {rate}"),
            Self::BlockDns { port } => write!(f, "block dns port {port}"),
        }
    }
}

/// Validates a `tc` rate such as `1024kbit` or `10mbit`.
pub fn validate_rate(rate: &str) -> Result<()> {
    const UNITS: [&str; 10] = [
        "bit", "kbit", "mbit", "gbit", "tbit", "bps", "kbps", "mbps", "gbps", "tbps",
    ];
    let rate = rate.trim().to_ascii_lowercase();
    let split = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rate.len());
    let (digits, unit) = rate.split_at(split);
    if digits.is_empty() || !UNITS.contains(&unit) {
        return Err(Error::InvalidConfig(format!(
            "invalid bandwidth '{rate}', expected e.g. '10mbit'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipnet_parse_and_display() {
        assert_eq!(net("10.1.2.3").to_string(), "10.1.2.3/32");
        assert_eq!(net("10.1.2.3/8").to_string(), "10.0.0.0/8");
        assert_eq!(net("::1").to_string(), "::1/128");
        assert_eq!(net("fe80::1/10").to_string(), "fe80::/10");
        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
        assert!("example.com".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_ipnet_contains() {
        let n = net("192.168.0.0/16");
        assert!(n.contains("192.168.4.2".parse().unwrap()));
        assert!(!n.contains("192.169.0.1".parse().unwrap()));
        assert!(!n.contains("::1".parse().unwrap()));
        assert!(IpNet::any(Family::V6).contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!("80".parse::<PortRange>().unwrap(), PortRange { from: 80, to: 80 });
        assert_eq!(
            "8000-8999".parse::<PortRange>().unwrap(),
            PortRange { from: 8000, to: 8999 }
        );
        assert!("0".parse::<PortRange>().is_err());
        assert!("90-80".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
        assert_eq!(PortRange { from: 1, to: 5 }.to_string(), "1-5");
    }

    #[test]
    fn test_filter_defaults() {
        let filter = Filter::from_config(&[], &[], &[], &[], &[], 8080, 8081).unwrap();
        assert_eq!(filter.include.len(), 2);
        assert!(filter.include.iter().all(|e| e.ports.is_all()));
        assert!(filter.exclude.is_empty());
        assert!(filter.affects("1.2.3.4".parse().unwrap(), 443));
    }

    #[test]
    fn test_filter_excludes_agent_and_restricted() {
        let agent: IpAddr = "10.0.0.5".parse().unwrap();
        let restricted = CidrWithPortRange::new(net("10.96.0.0/12"), PortRange::ALL);
        let filter = Filter::from_config(
            &["10.0.0.0/8".to_string()],
            &[],
            &["80".to_string(), "443".to_string()],
            &[restricted],
            &[agent],
            8080,
            8081,
        )
        .unwrap();
        assert_eq!(filter.include.len(), 2);
        assert_eq!(filter.exclude.len(), 3);
        assert!(filter.affects("10.1.1.1".parse().unwrap(), 80));
        assert!(!filter.affects("10.1.1.1".parse().unwrap(), 8080));
        assert!(!filter.affects("10.96.0.10".parse().unwrap(), 443));
        assert!(filter.affects(agent, 443));
        assert!(!filter.affects(agent, 8081));
    }

    #[test]
    fn test_block_dns_filter() {
        let filter = NetworkOpts::BlockDns { port: 53 }.filter();
        assert!(filter.affects("8.8.8.8".parse().unwrap(), 53));
        assert!(!filter.affects("8.8.8.8".parse().unwrap(), 443));
    }

    #[test]
    fn test_network_opts_serde() {
        let opts = NetworkOpts::Bandwidth {
            filter: Filter::from_config(&["1.2.3.4".to_string()], &[], &[], &[], &[], 1, 2).unwrap(),
            rate: "10mbit".to_string(),
            interfaces: vec!["eth0".to_string()],
        };
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["type"], "bandwidth");
        assert_eq!(json["filter"]["include"][0]["cidr"], "1.2.3.4/32");
        let back: NetworkOpts = serde_json::from_value(json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn test_validate_rate() {
        assert!(validate_rate("10mbit").is_ok());
        assert!(validate_rate("512kbps").is_ok());
        assert!(validate_rate("mbit").is_err());
        assert!(validate_rate("10 parsecs").is_err());
    }
}
