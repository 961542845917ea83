//! `tc` batches for shaping attacks.
//!
//! Per interface a `prio` root qdisc provides three bands. The shaping qdisc
//! hangs below band `1:3`; u32 filters steer excluded traffic into `1:1`
//! and included traffic into `1:3`. Anything unmatched follows the priomap
//! into `1:1` and stays untouched.
//!
//! ```text
//!              root 1: prio
//!           ┌──────┼──────┐
//!          1:1    1:2    1:3
//!   (excludes,           (includes)
//!    unmatched)             │
//!                      30: netem | tbf
//! ```
//!
//! | Filter prio | Family | Target                         |
//! |-------------|--------|--------------------------------|
//! | 1           | v4     | excludes → `1:1`               |
//! | 2           | v4     | includes → `1:3`               |
//! | 3           | v6     | excludes → `1:1`               |
//! | 4           | v6     | includes → `1:3`               |

use super::ports::port_masks;
use super::{CidrWithPortRange, Family, Mode, NetworkOpts};
use crate::error::{Error, Result};

const ROOT_QDISC: &str = "root handle 1: prio bands 3 priomap 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
const SHAPE_PARENT: &str = "parent 1:3 handle 30:";
const FLOW_EXCLUDED: &str = "1:1";
const FLOW_INCLUDED: &str = "1:3";

/// Compiles the `tc -batch` script of a shaping attack.
///
/// Returns an empty script for `ip rule` variants.
pub fn tc_commands(opts: &NetworkOpts, mode: Mode, interfaces: &[String]) -> Result<Vec<String>> {
    let Some(shape) = shape_qdisc(opts) else {
        return Ok(Vec::new());
    };
    if interfaces.is_empty() {
        return Err(Error::InvalidConfig(
            "no network interface to apply the attack to".to_string(),
        ));
    }
    let filter = opts.filter();
    let psh_only = matches!(opts, NetworkOpts::Delay { tcp_psh_only: true, .. });

    let mut cmds = Vec::new();
    for dev in interfaces {
        cmds.push(format!("qdisc add dev {dev} {ROOT_QDISC}"));
        cmds.push(format!("qdisc add dev {dev} {SHAPE_PARENT} {shape}"));

        for (family, base_prio) in [(Family::V4, 1), (Family::V6, 3)] {
            for entry in filter.excludes_of(family) {
                push_filters(&mut cmds, dev, family, base_prio, entry, FLOW_EXCLUDED, false);
            }
            for entry in filter.includes_of(family) {
                push_filters(&mut cmds, dev, family, base_prio + 1, entry, FLOW_INCLUDED, psh_only);
            }
        }
    }

    Ok(match mode {
        Mode::Add => cmds,
        Mode::Delete => cmds.into_iter().rev().map(|c| to_delete(&c)).collect(),
    })
}

fn shape_qdisc(opts: &NetworkOpts) -> Option<String> {
    match opts {
        NetworkOpts::Delay {
            delay_ms, jitter_ms, ..
        } => Some(if *jitter_ms > 0 {
            format!("netem delay {delay_ms}ms {jitter_ms}ms")
        } else {
            format!("netem delay {delay_ms}ms")
        }),
        NetworkOpts::PackageLoss { loss_percent, .. } => {
            Some(format!("netem loss random {loss_percent}%"))
        }
        NetworkOpts::PackageCorruption {
            corrupt_percent, ..
        } => Some(format!("netem corrupt {corrupt_percent}%")),
        NetworkOpts::Bandwidth { rate, .. } => Some(format!("tbf rate {rate} latency 50ms burst 5kb")),
        NetworkOpts::Blackhole { .. } | NetworkOpts::BlockDns { .. } => None,
    }
}

/// One filter per direction and port block.
fn push_filters(
    cmds: &mut Vec<String>,
    dev: &str,
    family: Family,
    prio: u32,
    entry: &CidrWithPortRange,
    flow: &str,
    psh_only: bool,
) {
    let sel = family.u32_selector();
    let head = format!(
        "filter add dev {dev} protocol {} parent 1: prio {prio} u32",
        family.tc_protocol()
    );
    let psh = if psh_only {
        format!(" match {sel} protocol 6 0xff match u8 0x08 0x08 at nexthdr+13")
    } else {
        String::new()
    };

    let blocks: Vec<Option<(u16, u16)>> = if entry.ports.is_all() {
        vec![None]
    } else {
        port_masks(entry.ports)
            .into_iter()
            .map(|m| Some((m.port, m.mask)))
            .collect()
    };

    for (addr_dir, port_dir) in [("dst", "dport"), ("src", "sport")] {
        for block in &blocks {
            let ports = match block {
                Some((port, mask)) => format!(" match {sel} {port_dir} {port} {mask:#06x}"),
                None => String::new(),
            };
            cmds.push(format!(
                "{head} match {sel} {addr_dir} {}{ports}{psh} flowid {flow}",
                entry.cidr
            ));
        }
    }
}

fn to_delete(cmd: &str) -> String {
    if let Some(rest) = cmd.strip_prefix("qdisc add ") {
        format!("qdisc del {rest}")
    } else if let Some(rest) = cmd.strip_prefix("filter add ") {
        format!("filter del {rest}")
    } else {
        cmd.to_string()
    }
}
