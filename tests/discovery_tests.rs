//! Discovery against the in-memory runtime client.

use extension_container::client::ContainerInfo;
use extension_container::testing::FakeRuntimeClient;
use extension_container::{Config, discover};
use std::collections::HashMap;

fn container(id: &str, running: bool, labels: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: format!("/{id}-name"),
        image: "registry.example.com:5000/team/api:2.1".to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        running,
    }
}

fn client() -> FakeRuntimeClient {
    let client = FakeRuntimeClient::new();
    client.add(container("aaa", true, &[("io.kubernetes.pod.name", "api-7d9f")]), 100);
    client.add(container("bbb", false, &[]), 101);
    client.add(container("ccc", true, &[("io.cri-containerd.kind", "sandbox")]), 102);
    client.add(container("ddd", true, &[("com.steadybit.agent", "true")]), 103);
    client.add(container("eee", true, &[("steadybit.com/discovery-disabled", "true")]), 104);
    client
}

#[tokio::test]
async fn test_discover_filters_containers() {
    let targets = discover(&client(), &Config::default()).await.unwrap();
    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["docker://aaa"]);

    let target = &targets[0];
    assert_eq!(target.target_type, "com.steadybit.extension_container.container");
    assert_eq!(target.label, "aaa-name");
    assert_eq!(target.attribute("k8s.pod.name"), Some("api-7d9f"));
    assert_eq!(target.attribute("container.engine"), Some("docker"));
    assert_eq!(target.attribute("container.engine.version"), Some("1.0.0-fake"));
    assert_eq!(target.attribute("container.image.registry"), Some("registry.example.com:5000"));
    assert_eq!(target.attribute("container.image.repository"), Some("team/api"));
    assert_eq!(target.attribute("container.image.tag"), Some("2.1"));
}

#[tokio::test]
async fn test_discover_with_excludes_disabled() {
    let config = Config {
        disable_discovery_excludes: true,
        ..Config::default()
    };
    let targets = discover(&client(), &config).await.unwrap();
    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["docker://aaa", "docker://eee"]);
}

#[tokio::test]
async fn test_discovered_targets_serialize() {
    let targets = discover(&client(), &Config::default()).await.unwrap();
    let json = serde_json::to_value(&targets).unwrap();
    assert_eq!(json[0]["targetType"], "com.steadybit.extension_container.container");
    assert_eq!(json[0]["attributes"]["container.id.stripped"][0], "aaa");
}
