//! `ip rule` scripts for blackhole and block-dns attacks.
//!
//! Includes become blackhole rules. Excludes are added afterwards and get a
//! lower preference number, so matching traffic is looked up in `main`
//! before a blackhole rule is reached.
//!
//! ```text
//! rule add blackhole to 0.0.0.0/0
//! rule add blackhole from 0.0.0.0/0
//! rule add to 10.0.0.5/32 dport 8080 table main
//! rule add from 10.0.0.5/32 sport 8080 table main
//! ```

use super::{CidrWithPortRange, Family, Mode, NetworkOpts};

/// Compiles the `ip -batch` script of `opts` for one address family.
///
/// Returns an empty script for `tc` based variants and for families without
/// entries. [`Mode::Delete`] yields the add script reversed with `del`.
pub fn ip_rule_commands(opts: &NetworkOpts, family: Family, mode: Mode) -> Vec<String> {
    if !opts.uses_ip_rules() {
        return Vec::new();
    }
    let filter = opts.filter();

    let mut rules = Vec::new();
    for entry in filter.includes_of(family) {
        rules.push(format!("rule add blackhole to {}{}", entry.cidr, port_selector(entry, "dport")));
        rules.push(format!("rule add blackhole from {}{}", entry.cidr, port_selector(entry, "sport")));
    }
    if rules.is_empty() {
        return rules;
    }
    for entry in filter.excludes_of(family) {
        rules.push(format!(
            "rule add to {}{} table main",
            entry.cidr,
            port_selector(entry, "dport")
        ));
        rules.push(format!(
            "rule add from {}{} table main",
            entry.cidr,
            port_selector(entry, "sport")
        ));
    }

    match mode {
        Mode::Add => rules,
        Mode::Delete => rules
            .into_iter()
            .rev()
            .map(|r| r.replacen("rule add", "rule del", 1))
            .collect(),
    }
}

fn port_selector(entry: &CidrWithPortRange, keyword: &str) -> String {
    if entry.ports.is_all() {
        String::new()
    } else {
        format!(" {} {}", keyword, entry.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Filter;

    fn blackhole(ips: &[&str], ports: &[&str]) -> NetworkOpts {
        let ips: Vec<String> = ips.iter().map(|s| s.to_string()).collect();
        let ports: Vec<String> = ports.iter().map(|s| s.to_string()).collect();
        let agent = ["10.0.0.5".parse().unwrap()];
        NetworkOpts::Blackhole {
            filter: Filter::from_config(&ips, &[], &ports, &[], &agent, 8080, 8081).unwrap(),
        }
    }

    #[test]
    fn test_blackhole_all() {
        let opts = blackhole(&[], &[]);
        assert_eq!(
            ip_rule_commands(&opts, Family::V4, Mode::Add),
            vec![
                "rule add blackhole to 0.0.0.0/0",
                "rule add blackhole from 0.0.0.0/0",
                "rule add to 10.0.0.5/32 dport 8080 table main",
                "rule add from 10.0.0.5/32 sport 8080 table main",
                "rule add to 10.0.0.5/32 dport 8081 table main",
                "rule add from 10.0.0.5/32 sport 8081 table main",
            ]
        );
        assert_eq!(
            ip_rule_commands(&opts, Family::V6, Mode::Add),
            vec!["rule add blackhole to ::/0", "rule add blackhole from ::/0"]
        );
    }

    #[test]
    fn test_blackhole_ports() {
        let opts = blackhole(&["1.2.3.4"], &["80", "443"]);
        let add = ip_rule_commands(&opts, Family::V4, Mode::Add);
        assert_eq!(add[0], "rule add blackhole to 1.2.3.4/32 dport 80");
        assert_eq!(add[3], "rule add blackhole from 1.2.3.4/32 sport 443");
        assert!(ip_rule_commands(&opts, Family::V6, Mode::Add).is_empty());
    }

    #[test]
    fn test_delete_is_reverse_of_add() {
        let opts = blackhole(&["1.2.3.0/24"], &["8000-8999"]);
        let add = ip_rule_commands(&opts, Family::V4, Mode::Add);
        let mut del = ip_rule_commands(&opts, Family::V4, Mode::Delete);
        del.reverse();
        let del: Vec<String> = del.iter().map(|r| r.replacen("rule del", "rule add", 1)).collect();
        assert_eq!(add, del);
    }

    #[test]
    fn test_block_dns() {
        let opts = NetworkOpts::BlockDns { port: 53 };
        assert_eq!(
            ip_rule_commands(&opts, Family::V4, Mode::Add),
            vec![
                "rule add blackhole to 0.0.0.0/0 dport 53",
                "rule add blackhole from 0.0.0.0/0 sport 53",
            ]
        );
    }

    #[test]
    fn test_tc_variants_have_no_rules() {
        let opts = NetworkOpts::PackageLoss {
            filter: Filter::default(),
            loss_percent: 10,
            interfaces: vec![],
        };
        assert!(ip_rule_commands(&opts, Family::V4, Mode::Add).is_empty());
    }
}
