//! Property tests for the network compilers.
//!
//! The tc scripts are checked with a small interpreter that classifies a
//! packet the way the u32 filters of the root `prio` qdisc would.

use extension_container::network::manager::compile;
use extension_container::network::{
    CidrWithPortRange, Family, Filter, IpNet, Mode, NetworkOpts, PortRange, Tool, port_masks,
    tc_commands,
};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

// =============================================================================
// tc Interpreter
// =============================================================================

struct U32Filter {
    prio: u32,
    cidr: IpNet,
    port: Option<(u16, u16)>,
    flow: String,
}

/// Parses the egress (`dst`/`dport`) IPv4 filters of a script.
fn egress_filters(cmds: &[String]) -> Vec<U32Filter> {
    let mut filters = Vec::new();
    for cmd in cmds {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        if !cmd.starts_with("filter add") || !tokens.contains(&"dst") || !tokens.contains(&"ip") {
            continue;
        }
        let after = |key: &str, n: usize| {
            tokens
                .iter()
                .position(|t| *t == key)
                .map(|i| tokens[i + n])
        };
        let prio = after("prio", 1).unwrap().parse().unwrap();
        let cidr = after("dst", 1).unwrap().parse().unwrap();
        let port = after("dport", 1).map(|p| {
            let mask = after("dport", 2).unwrap().trim_start_matches("0x");
            (p.parse().unwrap(), u16::from_str_radix(mask, 16).unwrap())
        });
        let flow = after("flowid", 1).unwrap().to_string();
        filters.push(U32Filter {
            prio,
            cidr,
            port,
            flow,
        });
    }
    filters.sort_by_key(|f| f.prio);
    filters
}

/// Band an outgoing packet to `peer:port` ends up in.
fn classify(filters: &[U32Filter], peer: IpAddr, port: u16) -> &str {
    filters
        .iter()
        .find(|f| {
            f.cidr.contains(peer)
                && f.port.is_none_or(|(p, mask)| port & mask == p & mask)
        })
        .map(|f| f.flow.as_str())
        .unwrap_or("1:1")
}

fn delay(filter: Filter) -> NetworkOpts {
    NetworkOpts::Delay {
        filter,
        delay_ms: 100,
        jitter_ms: 0,
        interfaces: vec!["eth0".to_string()],
        tcp_psh_only: false,
    }
}

fn v4(a: u8, b: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, a, b, 1))
}

// =============================================================================
// Port Masks
// =============================================================================

proptest! {
    #[test]
    fn test_port_masks_cover_range_exactly(from in 1u16..=65535, len in 0u16..4000, probe in any::<u16>()) {
        let to = from.saturating_add(len);
        let range = PortRange::new(from, to).unwrap();
        let masks = port_masks(range);

        prop_assert_eq!(masks[0].port, from);
        prop_assert_eq!(masks.last().unwrap().last(), to);
        for pair in masks.windows(2) {
            prop_assert_eq!(u32::from(pair[0].last()) + 1, u32::from(pair[1].port));
        }
        let total: u32 = masks.iter().map(|m| m.size()).sum();
        prop_assert_eq!(total, u32::from(to) - u32::from(from) + 1);

        let covered = masks.iter().any(|m| m.matches(probe));
        prop_assert_eq!(covered, range.contains(probe));
    }

    #[test]
    fn test_tc_classification_matches_filter(
        include_net in 0u8..4,
        exclude_host in 0u8..4,
        port_from in 1u16..2000,
        port_len in 0u16..300,
        peer_net in 0u8..4,
        peer_port in 1u16..2400,
    ) {
        let ports = PortRange::new(port_from, port_from + port_len).unwrap();
        let filter = Filter {
            include: vec![CidrWithPortRange::new(
                IpNet::new(v4(include_net, 0), 16).unwrap(),
                ports,
            )],
            exclude: vec![CidrWithPortRange::new(
                IpNet::host(v4(exclude_host, 0)),
                PortRange::ALL,
            )],
        };
        let cmds = tc_commands(&delay(filter.clone()), Mode::Add, &["eth0".to_string()]).unwrap();
        let filters = egress_filters(&cmds);

        for peer in [v4(peer_net, 0), v4(peer_net, 7)] {
            let shaped = classify(&filters, peer, peer_port) == "1:3";
            prop_assert_eq!(shaped, filter.affects(peer, peer_port));
        }
    }
}

// =============================================================================
// Add / Delete Symmetry
// =============================================================================

#[test]
fn test_delete_reverses_add() {
    let filter = Filter::from_config(
        &["10.0.0.0/8".to_string(), "fd00::/8".to_string()],
        &[],
        &["80".to_string(), "8000-8100".to_string()],
        &[],
        &["192.168.1.10".parse().unwrap()],
        8086,
        8082,
    )
    .unwrap();

    for opts in [NetworkOpts::Blackhole { filter: filter.clone() }, delay(filter)] {
        let add = compile(&opts, Mode::Add).unwrap();
        let delete = compile(&opts, Mode::Delete).unwrap();
        assert_eq!(add.len(), delete.len());

        let added: Vec<String> = add.iter().flat_map(|b| b.commands.clone()).collect();
        let mut deleted: Vec<String> = delete.iter().flat_map(|b| b.commands.clone()).collect();
        deleted.reverse();
        let restored: Vec<String> = deleted
            .iter()
            .map(|c| c.replacen(" del ", " add ", 1).replacen("rule del", "rule add", 1))
            .collect();
        assert_eq!(added, restored, "{opts}");
    }
}

#[test]
fn test_blackhole_batches_per_family() {
    let filter = Filter::from_config(
        &["10.0.0.0/8".to_string(), "fd00::/8".to_string()],
        &[],
        &[],
        &[],
        &[],
        8086,
        8082,
    )
    .unwrap();
    let batches = compile(&NetworkOpts::Blackhole { filter }, Mode::Add).unwrap();
    let tools: Vec<Tool> = batches.iter().map(|b| b.tool).collect();
    assert_eq!(tools, vec![Tool::Ip(Family::V4), Tool::Ip(Family::V6)]);
    assert!(batches[1].script().contains("fd00::/8"));
    assert!(batches.iter().all(|b| b.script().ends_with('\n')));
}

#[test]
fn test_block_dns_targets_dns_port_everywhere() {
    let opts = NetworkOpts::BlockDns { port: 53 };
    let batches = compile(&opts, Mode::Add).unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches[0].script().contains("rule add blackhole to 0.0.0.0/0 dport 53"));
    assert!(batches[1].script().contains("rule add blackhole to ::/0 dport 53"));
}

#[test]
fn test_network_opts_state_roundtrip() {
    let filter = Filter::from_config(
        &["10.0.0.0/8".to_string()],
        &["2001:db8::1".parse().unwrap()],
        &["443".to_string()],
        &[],
        &[],
        8086,
        8082,
    )
    .unwrap();
    let opts = NetworkOpts::Bandwidth {
        filter,
        rate: "1mbit".to_string(),
        interfaces: vec!["eth0".to_string(), "eth1".to_string()],
    };
    let json = serde_json::to_value(&opts).unwrap();
    assert_eq!(json["type"], "bandwidth");
    let back: NetworkOpts = serde_json::from_value(json).unwrap();
    assert_eq!(back, opts);
}
