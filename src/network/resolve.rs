//! Hostname resolution as seen from the target.
//!
//! A `dig` sidecar joins the target's network namespace and reads the
//! target's `/etc/hosts` and `/etc/resolv.conf`, so search domains, cluster
//! DNS and host overrides apply exactly as they do for the target.

use crate::constants::DIG_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::introspect::NamespaceKind;
use crate::sidecar::{SidecarOpts, SidecarSpec, Sidecars};
use std::net::IpAddr;
use tracing::debug;

/// Resolves hostnames through a `dig` sidecar.
#[derive(Clone)]
pub struct HostnameResolver {
    sidecars: Sidecars,
}

impl HostnameResolver {
    pub fn new(sidecars: Sidecars) -> Self {
        Self { sidecars }
    }

    /// Resolves `hostnames` to their A and AAAA records.
    ///
    /// Inputs that already are IP addresses pass through. Fails with
    /// [`Error::ResolutionFailed`] if any lookup fails or nothing resolves.
    pub async fn resolve(&self, opts: &SidecarOpts, hostnames: &[String]) -> Result<Vec<IpAddr>> {
        let mut ips = Vec::new();
        let mut names = Vec::new();
        for host in hostnames.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
            match host.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) => names.push(host.to_string()),
            }
        }
        if names.is_empty() {
            return Ok(ips);
        }

        let spec = SidecarSpec::new("dig", dig_args())
            .with_namespaces(&[NamespaceKind::Net, NamespaceKind::Uts])
            .mount_or_copy_from_target("/etc/hosts", "/etc/hosts")
            .mount_or_copy_from_target("/etc/resolv.conf", "/etc/resolv.conf");

        let output = self
            .sidecars
            .run_to_completion(opts, &spec, Some(dig_input(&names).into_bytes()))
            .await
            .map_err(|e| Error::ResolutionFailed {
                hostnames: names.clone(),
                reason: e.to_string(),
            })?;

        let resolved = parse_dig_output(&output.stdout_text());
        if resolved.is_empty() {
            return Err(Error::ResolutionFailed {
                hostnames: names.clone(),
                reason: "no addresses returned".to_string(),
            });
        }
        debug!(execution_id = %opts.execution_id, "resolved {} to {:?}", names.join(", "), resolved);

        for ip in resolved {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

fn dig_args() -> Vec<String> {
    vec![
        "dig".to_string(),
        "-f-".to_string(),
        format!("+timeout={DIG_TIMEOUT_SECS}"),
        "+short".to_string(),
        "+nottlid".to_string(),
        "+noclass".to_string(),
    ]
}

/// Batch input for `dig -f-`: one A and one AAAA query per name.
pub fn dig_input(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("{n} A\n{n} AAAA\n"))
        .collect()
}

/// Extracts the addresses of `dig +short` output, skipping CNAME targets.
pub fn parse_dig_output(output: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for ip in output.lines().filter_map(|l| l.trim().parse::<IpAddr>().ok()) {
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}
