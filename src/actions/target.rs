//! Target resolution and policy gates shared by all actions.

use super::{ActionContext, ActionError, ActionRequest};
use crate::client::{ContainerInfo, strip_runtime_prefix};
use crate::constants::{ATTR_CONTAINER_ID, ATTR_K8S_NAMESPACE, LABEL_K8S_POD_NAMESPACE};
use crate::error::{Error, Result};
use crate::introspect::TargetProcess;
use crate::sidecar::SidecarOpts;
use tracing::debug;

/// A container resolved for an attack.
#[derive(Debug, Clone)]
pub struct ResolvedContainer {
    /// Bare container id.
    pub id: String,
    pub info: ContainerInfo,
}

/// A container together with its init process.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub container: ResolvedContainer,
    pub process: TargetProcess,
    pub sidecar: SidecarOpts,
}

/// Looks up the container of a request and applies the namespace policy.
pub async fn resolve_container(ctx: &ActionContext, request: &ActionRequest) -> Result<ResolvedContainer> {
    let raw = request
        .target
        .as_ref()
        .and_then(|t| t.container_id())
        .ok_or_else(|| Error::TargetMissing(ATTR_CONTAINER_ID.to_string()))?;
    let id = strip_runtime_prefix(raw).to_string();
    let info = ctx.client.info(&id).await?;

    let namespace = info
        .labels
        .get(LABEL_K8S_POD_NAMESPACE)
        .map(String::as_str)
        .or_else(|| {
            request
                .target
                .as_ref()
                .and_then(|t| t.attribute(ATTR_K8S_NAMESPACE))
        });
    check_disallowed(&ctx.config.disallow_k8s_namespaces, namespace)?;

    Ok(ResolvedContainer { id, info })
}

/// Resolves the container and inspects its init process.
pub async fn resolve_target(ctx: &ActionContext, request: &ActionRequest) -> Result<ResolvedTarget> {
    let container = resolve_container(ctx, request).await?;
    let pid = ctx.client.get_pid(&container.id).await?;
    let process = TargetProcess::inspect(&ctx.proc_root, pid)?;
    debug!(container = %container.id, pid, cgroup = %process.cgroup_path, "resolved target");
    let sidecar = SidecarOpts::new(process.clone(), &container.id, request.execution_id);
    Ok(ResolvedTarget {
        container,
        process,
        sidecar,
    })
}

/// Fails with [`Error::Disallowed`] if `namespace` matches a pattern.
pub fn check_disallowed(patterns: &[String], namespace: Option<&str>) -> Result<()> {
    let Some(namespace) = namespace else {
        return Ok(());
    };
    for pattern in patterns {
        let matches = match glob::Pattern::new(pattern) {
            Ok(p) => p.matches(namespace),
            Err(_) => pattern == namespace,
        };
        if matches {
            return Err(Error::Disallowed {
                namespace: namespace.to_string(),
                pattern: pattern.clone(),
            });
        }
    }
    Ok(())
}

/// The user-facing refusal for targets on the host network, if any.
pub fn host_network_refusal(ctx: &ActionContext, target: &ResolvedTarget, fail_on_host_network: bool) -> Option<ActionError> {
    if fail_on_host_network && target.process.uses_host_network(&ctx.proc_root) {
        let e = Error::HostNetworkRefused(target.container.id.clone());
        return Some(ActionError::from(&e));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_disallowed() {
        let patterns = vec!["kube-*".to_string(), "steadybit-agent".to_string()];
        assert!(check_disallowed(&patterns, Some("default")).is_ok());
        assert!(check_disallowed(&patterns, None).is_ok());
        let err = check_disallowed(&patterns, Some("kube-system")).unwrap_err();
        assert!(err.to_string().contains("kube-*"));
        assert!(check_disallowed(&patterns, Some("steadybit-agent")).is_err());
    }
}
