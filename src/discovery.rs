//! Container discovery.
//!
//! Lists the runtime's containers and maps each attackable one to a target
//! with canonical attributes:
//!
//! | Source                            | Attribute                    |
//! |-----------------------------------|------------------------------|
//! | runtime prefix + id               | `container.id`               |
//! | id                                | `container.id.stripped`      |
//! | name                              | `container.name`             |
//! | image reference                   | `container.image[.registry\|.repository\|.tag]` |
//! | `io.kubernetes.pod.name`          | `k8s.pod.name`               |
//! | `io.kubernetes.pod.namespace`     | `k8s.namespace`              |
//! | `io.kubernetes.container.name`    | `k8s.container.name`         |
//! | `app.kubernetes.io/<x>`           | `k8s.app.<x>`                |
//! | any other label                   | `container.label.<label>`    |
//!
//! Sandbox and pause containers and the agent itself are never reported.

use crate::client::{ContainerInfo, ContainerRuntimeClient};
use crate::config::Config;
use crate::constants::{
    ATTR_CONTAINER_ID, ATTR_CONTAINER_ID_STRIPPED, ATTR_K8S_NAMESPACE, LABEL_AGENT,
    LABEL_CRI_CONTAINERD_KIND, LABEL_DISCOVERY_DISABLED, LABEL_DOCKER_TYPE,
    LABEL_ECS_CONTAINER_NAME, LABEL_K8S_APP_PREFIX, LABEL_K8S_CONTAINER_NAME,
    LABEL_K8S_POD_NAME, LABEL_K8S_POD_NAMESPACE, TARGET_TYPE,
};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A discovered container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub label: String,
    pub target_type: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Target {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

/// Parts of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

/// Splits `registry/repository:tag` with Docker's defaults.
///
/// The first path component is a registry only if it looks like a host
/// (contains `.` or `:`, or is `localhost`). Digests are dropped.
pub fn parse_image(image: &str) -> ImageRef {
    let image = image.split('@').next().unwrap_or(image);
    let (registry, rest) = match image.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest)
        }
        _ => (DEFAULT_REGISTRY.to_string(), image),
    };
    let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (repository, tag) = match rest[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (rest[..split].to_string(), rest[split + 1..].to_string())
        }
        None => (rest.to_string(), DEFAULT_TAG.to_string()),
    };
    ImageRef {
        registry,
        repository,
        tag,
    }
}

fn is_excluded(info: &ContainerInfo, config: &Config) -> bool {
    let label = |key: &str| info.labels.get(key).map(String::as_str);
    label(LABEL_CRI_CONTAINERD_KIND) == Some("sandbox")
        || label(LABEL_DOCKER_TYPE) == Some("podsandbox")
        || label(LABEL_ECS_CONTAINER_NAME) == Some("~internal~ecs~pause")
        || label(LABEL_AGENT) == Some("true")
        || (!config.disable_discovery_excludes && label(LABEL_DISCOVERY_DISABLED) == Some("true"))
}

fn label_attribute(label: &str) -> String {
    match label {
        LABEL_K8S_POD_NAME => "k8s.pod.name".to_string(),
        LABEL_K8S_POD_NAMESPACE => ATTR_K8S_NAMESPACE.to_string(),
        LABEL_K8S_CONTAINER_NAME => "k8s.container.name".to_string(),
        _ => match label.strip_prefix(LABEL_K8S_APP_PREFIX) {
            Some(app) => format!("k8s.app.{app}"),
            None => format!("container.label.{label}"),
        },
    }
}

/// Host facts added to every target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    pub hostname: String,
    pub engine: String,
    pub engine_version: Option<String>,
}

/// Maps a container to a target. Returns `None` for excluded containers.
pub fn to_target(info: &ContainerInfo, prefix: &str, host: &HostFacts, config: &Config) -> Option<Target> {
    if is_excluded(info, config) {
        return None;
    }
    let name = info.name.trim_start_matches('/').to_string();
    let id = format!("{prefix}{}", info.id);
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut put = |key: String, value: String| {
        attributes.entry(key).or_default().push(value);
    };

    put(ATTR_CONTAINER_ID.to_string(), id.clone());
    put(ATTR_CONTAINER_ID_STRIPPED.to_string(), info.id.clone());
    put("container.name".to_string(), name.clone());
    put("container.host".to_string(), host.hostname.clone());
    put("container.engine".to_string(), host.engine.clone());
    if let Some(version) = &host.engine_version {
        put("container.engine.version".to_string(), version.clone());
    }
    if !info.image.is_empty() {
        let image = parse_image(&info.image);
        put("container.image".to_string(), info.image.clone());
        put("container.image.registry".to_string(), image.registry);
        put("container.image.repository".to_string(), image.repository);
        put("container.image.tag".to_string(), image.tag);
    }
    let mut labels: Vec<_> = info.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        put(label_attribute(key), value.clone());
    }

    let excludes: Vec<glob::Pattern> = config
        .discovery_attributes_excludes
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    attributes.retain(|key, _| !excludes.iter().any(|p| p.matches(key)));

    Some(Target {
        id,
        label: if name.is_empty() { info.id.clone() } else { name },
        target_type: TARGET_TYPE.to_string(),
        attributes,
    })
}

/// Lists all attackable containers of the runtime.
pub async fn discover(client: &dyn ContainerRuntimeClient, config: &Config) -> Result<Vec<Target>> {
    let hostname = match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("failed to read hostname: {}", e);
            String::new()
        }
    };
    let engine_version = match client.version().await {
        Ok(version) => Some(version),
        Err(e) => {
            warn!("failed to read {} version: {}", client.runtime(), e);
            None
        }
    };
    let host = HostFacts {
        hostname,
        engine: client.runtime().name().to_string(),
        engine_version,
    };

    let containers = client.list().await?;
    let total = containers.len();
    let prefix = client.runtime().id_prefix();
    let targets: Vec<Target> = containers
        .iter()
        .filter(|c| c.running)
        .filter_map(|c| to_target(c, prefix, &host, config))
        .collect();
    debug!("discovered {} of {} containers", targets.len(), total);
    Ok(targets)
}
