//! Attack lifecycle tests against the in-memory runtime and runner.
//!
//! Each fixture builds a small procfs/cgroupfs tree in a temp directory so
//! target inspection, cgroup adaptation and namespace checks run for real
//! while no process is ever started.

use extension_container::actions::{ActionRequest, ErrorStatus, TargetRef, action_id};
use extension_container::client::ContainerInfo;
use extension_container::testing::{FakeOciRunner, FakeRuntimeClient};
use extension_container::{
    ActionContext, ActionKit, Bundle, Config, Error, ProcessExit, RunOutput,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const CONTAINER: &str = "abc123def456";
const PID: u32 = 4242;

struct Fixture {
    _temp: TempDir,
    workdir: PathBuf,
    client: Arc<FakeRuntimeClient>,
    runner: Arc<FakeOciRunner>,
    kit: ActionKit,
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn proc_tree(root: &Path) {
    for pid in [1, PID] {
        for ns in ["pid", "net", "mnt", "ipc", "uts", "cgroup"] {
            write(&root.join(format!("{pid}/ns/{ns}")), "");
        }
    }
    write(&root.join(format!("{PID}/cgroup")), "0::/kubepods/abc\n");
    write(&root.join(format!("{PID}/status")), "Name:\tapp\nCpus_allowed_list:\t0-3\n");
    write(&root.join(format!("{PID}/root/etc/hosts")), "127.0.0.1 localhost\n");
    write(&root.join(format!("{PID}/root/etc/resolv.conf")), "nameserver 10.96.0.10\n");
}

fn cgroup_tree(root: &Path) {
    write(&root.join("cgroup.controllers"), "cpu memory");
    write(&root.join("kubepods/abc/cpu.max"), "50000 100000\n");
    write(&root.join("kubepods/abc/memory.max"), "1073741824\n");
    write(&root.join("kubepods/abc/memory.current"), "104857600\n");
}

fn fixture_with(labels: &[(&str, &str)], configure: impl FnOnce(&mut Config)) -> Fixture {
    let temp = TempDir::new().unwrap();
    let proc_root = temp.path().join("proc");
    let cgroup_root = temp.path().join("cgroup");
    let image = temp.path().join("image");
    let workdir = temp.path().join("work");
    proc_tree(&proc_root);
    cgroup_tree(&cgroup_root);
    write(&image.join("bin/stress-ng"), "");
    fs::create_dir_all(&workdir).unwrap();

    let mut config = Config {
        workdir: workdir.clone(),
        sidecar_image_path: image,
        memfill_path: temp.path().join("memfill"),
        ..Config::default()
    };
    configure(&mut config);

    let client = Arc::new(FakeRuntimeClient::new());
    client.add(
        ContainerInfo {
            id: CONTAINER.to_string(),
            name: "/web".to_string(),
            image: "nginx:1.25".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            running: true,
        },
        PID,
    );
    let runner = Arc::new(FakeOciRunner::new());
    let ctx = ActionContext::with_roots(
        config,
        client.clone(),
        runner.clone(),
        &proc_root,
        &cgroup_root,
        vec!["10.1.0.2".parse().unwrap()],
    );
    Fixture {
        _temp: temp,
        workdir,
        client,
        runner,
        kit: ActionKit::new(Arc::new(ctx)),
    }
}

fn fixture() -> Fixture {
    fixture_with(&[], |_| {})
}

fn request(config: Value) -> ActionRequest {
    ActionRequest::new(
        Uuid::new_v4(),
        TargetRef::container(&format!("docker://{CONTAINER}")),
        config,
    )
}

fn bundles(workdir: &Path) -> Vec<String> {
    fs::read_dir(workdir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

// =============================================================================
// Catalog
// =============================================================================

#[test]
fn test_catalog_ids_are_unique() {
    let f = fixture();
    let descriptions = f.kit.describe_all();
    assert_eq!(descriptions.len(), 13);
    let mut ids: Vec<_> = descriptions.iter().map(|d| d.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 13);
    assert!(ids.iter().all(|id| id.starts_with("com.steadybit.extension_container.")));
}

#[tokio::test]
async fn test_unknown_action() {
    let f = fixture();
    let err = f.kit.prepare("com.example.nope", &request(json!({}))).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

// =============================================================================
// Target Resolution
// =============================================================================

#[tokio::test]
async fn test_prepare_without_target() {
    let f = fixture();
    let mut req = request(json!({"duration": 1000}));
    req.target = None;
    let err = f.kit.prepare(&action_id("pause"), &req).await.unwrap_err();
    assert!(matches!(err, Error::TargetMissing(_)));
}

#[tokio::test]
async fn test_prepare_disallowed_namespace() {
    let f = fixture_with(&[("io.kubernetes.pod.namespace", "kube-system")], |c| {
        c.disallow_k8s_namespaces = vec!["kube-*".to_string()];
    });
    let err = f
        .kit
        .prepare(&action_id("stress_cpu"), &request(json!({"duration": 1000})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disallowed { .. }));
    assert!(f.runner.calls().is_empty());
}

#[tokio::test]
async fn test_prepare_unknown_container() {
    let f = fixture();
    let mut req = request(json!({"duration": 1000}));
    req.target = Some(TargetRef::container("docker://missing"));
    let err = f.kit.prepare(&action_id("pause"), &req).await.unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Pause / Stop Container
// =============================================================================

#[tokio::test]
async fn test_pause_then_stop_unpauses() {
    let f = fixture();
    let id = action_id("pause");
    let prepared = f.kit.prepare(&id, &request(json!({"duration": 5000}))).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    let status = f.kit.status(&id, &prepared.state).await.unwrap();
    assert!(!status.completed);

    let stopped = f.kit.stop(&id, &prepared.state).await.unwrap();
    assert!(stopped.error.is_none());
    assert_eq!(
        f.client.calls(),
        vec![format!("pause {CONTAINER}"), format!("unpause {CONTAINER}")]
    );

    // Idempotent stop; status of a finished execution reports completed.
    f.kit.stop(&id, &prepared.state).await.unwrap();
    assert_eq!(f.client.calls().len(), 2);
    assert!(f.kit.status(&id, &prepared.state).await.unwrap().completed);
}

#[tokio::test]
async fn test_stop_container_completes() {
    let f = fixture();
    let id = action_id("stop");
    let prepared = f.kit.prepare(&id, &request(json!({"graceful": false}))).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    let status = f.kit.status(&id, &prepared.state).await.unwrap();
    assert!(status.completed);
    assert!(status.error.is_none());
    assert_eq!(f.client.calls(), vec![format!("stop {CONTAINER} graceful=false")]);
}

#[tokio::test]
async fn test_stop_container_failure_fails_start() {
    let f = fixture();
    f.client.set_stop_error("permission denied");
    let id = action_id("stop");
    let prepared = f.kit.prepare(&id, &request(json!({}))).await.unwrap();
    let err = f.kit.start(&id, &prepared.state).await.unwrap_err();
    assert!(err.to_string().contains("permission denied"));
    assert!(f.kit.context().registry.is_empty());
}

#[tokio::test]
async fn test_slow_stop_container_reports_later() {
    let f = fixture();
    f.client.set_stop_delay(Duration::from_millis(1500));
    let id = action_id("stop");
    let prepared = f.kit.prepare(&id, &request(json!({}))).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();
    assert!(!f.kit.status(&id, &prepared.state).await.unwrap().completed);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(f.kit.status(&id, &prepared.state).await.unwrap().completed);
}

// =============================================================================
// Sidecar Attacks
// =============================================================================

#[tokio::test]
async fn test_stress_cpu_adapts_and_cleans_up() {
    let f = fixture();
    let id = action_id("stress_cpu");
    let prepared = f
        .kit
        .prepare(&id, &request(json!({"duration": 10000, "cpuLoad": 100})))
        .await
        .unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    let spawned = f.runner.spawned();
    assert_eq!(spawned.len(), 1);
    // 500m limit at 100% load: one worker at 50%.
    assert_eq!(
        spawned[0].args.join(" "),
        "stress-ng --cpu 1 --cpu-load 50 --timeout 10s"
    );
    assert_eq!(bundles(&f.workdir).len(), 1);
    let bundle = Bundle::load(&f.workdir.join(&spawned[0].id)).unwrap();
    for ns in ["pid", "cgroup", "uts"] {
        let joined = bundle.spec().namespace(ns).unwrap();
        assert!(joined.path.as_deref().unwrap().ends_with(&format!("/ns/{ns}")));
    }

    assert!(!f.kit.status(&id, &prepared.state).await.unwrap().completed);
    f.kit.stop(&id, &prepared.state).await.unwrap();
    assert!(f.runner.live().is_empty());
    assert!(bundles(&f.workdir).is_empty());
}

#[tokio::test]
async fn test_stress_exit_zero_completes() {
    let f = fixture();
    let id = action_id("stress_cpu");
    let prepared = f.kit.prepare(&id, &request(json!({"duration": 1000}))).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    assert_eq!(f.runner.exit("stress", ProcessExit { exit_code: 0, stderr: String::new() }), 1);
    let status = f.kit.status(&id, &prepared.state).await.unwrap();
    assert!(status.completed);
    assert!(status.error.is_none());
    assert!(bundles(&f.workdir).is_empty());
    assert!(f.kit.context().registry.is_empty());
}

#[tokio::test]
async fn test_stress_mem_oom_kill_is_ignored() {
    let f = fixture();
    let id = action_id("stress_mem");
    let prepared = f
        .kit
        .prepare(&id, &request(json!({"duration": 5000, "percentage": 50})))
        .await
        .unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();
    // 50% of 1GiB for one worker.
    assert!(f.runner.spawned()[0].args.join(" ").contains("--vm-bytes 524288K"));

    f.runner.exit("stress", ProcessExit { exit_code: 137, stderr: String::new() });
    let status = f.kit.status(&id, &prepared.state).await.unwrap();
    assert!(status.completed);
    assert!(status.error.is_none());
    assert_eq!(status.messages.len(), 1);
}

#[tokio::test]
async fn test_stress_mem_oom_kill_fails_when_requested() {
    let f = fixture();
    let id = action_id("stress_mem");
    let prepared = f
        .kit
        .prepare(&id, &request(json!({"duration": 5000, "failOnOomKill": true})))
        .await
        .unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    f.runner.exit("stress", ProcessExit { exit_code: 137, stderr: "killed".to_string() });
    let status = f.kit.status(&id, &prepared.state).await.unwrap();
    assert!(status.completed);
    assert_eq!(status.error.unwrap().status, ErrorStatus::Errored);
}

#[tokio::test]
async fn test_early_sidecar_failure_fails_start() {
    let f = fixture();
    f.runner.exit_on_spawn(ProcessExit {
        exit_code: 2,
        stderr: "stress-ng: unrecognized option".to_string(),
    });
    let id = action_id("stress_cpu");
    let prepared = f.kit.prepare(&id, &request(json!({"duration": 1000}))).await.unwrap();
    let err = f.kit.start(&id, &prepared.state).await.unwrap_err();
    assert!(matches!(err, Error::SidecarExitUnexpected { exit_code: 2, .. }));
    assert!(bundles(&f.workdir).is_empty());
    assert!(f.kit.context().registry.is_empty());
}

#[tokio::test]
async fn test_fill_memory_runs_memfill() {
    let f = fixture();
    let id = action_id("fill_memory");
    let prepared = f
        .kit
        .prepare(&id, &request(json!({"duration": 3000, "percentage": 50})))
        .await
        .unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();
    let args = f.runner.spawned()[0].args.clone();
    assert_eq!(args[0], "/memfill");
    // 50% of the 1GiB limit.
    assert_eq!(args[1], "512M");
    assert_eq!(args.last().map(String::as_str), Some("3s"));
    f.kit.stop(&id, &prepared.state).await.unwrap();
    assert!(bundles(&f.workdir).is_empty());
}

#[tokio::test]
async fn test_concurrent_attacks_on_one_container() {
    let f = fixture();
    let cpu = action_id("stress_cpu");
    let mem = action_id("stress_mem");
    let a = f.kit.prepare(&cpu, &request(json!({"duration": 1000}))).await.unwrap();
    let b = f.kit.prepare(&mem, &request(json!({"duration": 1000}))).await.unwrap();
    f.kit.start(&cpu, &a.state).await.unwrap();
    f.kit.start(&mem, &b.state).await.unwrap();
    assert_eq!(f.runner.live().len(), 2);

    f.kit.shutdown().await.unwrap();
    assert!(f.runner.live().is_empty());
    assert!(bundles(&f.workdir).is_empty());
}

// =============================================================================
// Network Attacks
// =============================================================================

fn delay_config() -> Value {
    json!({
        "duration": 5000,
        "networkDelay": 200,
        "networkInterface": ["eth0"],
        "failOnHostNetwork": false,
    })
}

#[tokio::test]
async fn test_network_delay_apply_and_revert() {
    let f = fixture();
    let id = action_id("network_delay");
    let prepared = f.kit.prepare(&id, &request(delay_config())).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    let runs = f.runner.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].args, vec!["tc", "-force", "-batch", "-"]);
    let script = runs[0].stdin.clone().unwrap();
    assert!(script.contains("dev eth0"));
    assert!(script.contains("delay 200ms"));

    f.kit.stop(&id, &prepared.state).await.unwrap();
    let runs = f.runner.runs();
    assert_eq!(runs.len(), 2);
    assert!(runs[1].stdin.as_deref().unwrap().contains("qdisc del"));
    assert!(bundles(&f.workdir).is_empty());
}

#[tokio::test]
async fn test_second_network_attack_is_rejected() {
    let f = fixture();
    let delay = action_id("network_delay");
    let first = f.kit.prepare(&delay, &request(delay_config())).await.unwrap();
    f.kit.start(&delay, &first.state).await.unwrap();

    let err = f.kit.prepare(&delay, &request(delay_config())).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyAttacked { .. }));

    f.kit.stop(&delay, &first.state).await.unwrap();
    let again = f.kit.prepare(&delay, &request(delay_config())).await.unwrap();
    f.kit.start(&delay, &again.state).await.unwrap();
    f.kit.stop(&delay, &again.state).await.unwrap();
}

#[tokio::test]
async fn test_host_network_is_refused() {
    let f = fixture();
    // Point the target's net namespace at the host's.
    let proc_root = f.kit.context().proc_root.clone();
    let target_net = proc_root.join(format!("{PID}/ns/net"));
    fs::remove_file(&target_net).unwrap();
    fs::hard_link(proc_root.join("1/ns/net"), &target_net).unwrap();

    let id = action_id("network_blackhole");
    let prepared = f
        .kit
        .prepare(&id, &request(json!({"duration": 1000})))
        .await
        .unwrap();
    let error = prepared.error.unwrap();
    assert_eq!(error.status, ErrorStatus::Failed);
    assert!(f.runner.calls().is_empty());
}

#[tokio::test]
async fn test_blackhole_uses_ip_rules() {
    let f = fixture();
    let id = action_id("network_blackhole");
    let config = json!({"duration": 1000, "ip": ["10.2.0.0/16"], "failOnHostNetwork": false});
    let prepared = f.kit.prepare(&id, &request(config)).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();

    let runs = f.runner.runs();
    assert!(!runs.is_empty());
    assert_eq!(runs[0].args[0], "ip");
    assert!(runs.iter().all(|r| r.stdin.as_deref().unwrap().contains("rule add")));
    f.kit.stop(&id, &prepared.state).await.unwrap();
    assert!(
        f.runner.runs()[runs.len()..]
            .iter()
            .all(|r| r.stdin.as_deref().unwrap().contains("rule del"))
    );
}

#[tokio::test]
async fn test_failed_apply_releases_namespace() {
    let f = fixture();
    f.runner.on_run(|_, _| RunOutput {
        exit_code: 2,
        stdout: Vec::new(),
        stderr: b"RTNETLINK answers: Operation not permitted".to_vec(),
    });
    let id = action_id("network_delay");
    let prepared = f.kit.prepare(&id, &request(delay_config())).await.unwrap();
    assert!(f.kit.start(&id, &prepared.state).await.is_err());
    assert!(f.kit.context().network.active_namespaces().unwrap().is_empty());
    assert!(f.kit.context().registry.is_empty());
}

#[tokio::test]
async fn test_hostname_resolution_through_dig() {
    let f = fixture();
    f.runner.on_run(|args, _| {
        let stdout = if args.first().map(String::as_str) == Some("dig") {
            b"93.184.216.34\n".to_vec()
        } else {
            Vec::new()
        };
        RunOutput {
            exit_code: 0,
            stdout,
            stderr: Vec::new(),
        }
    });
    let id = action_id("network_delay");
    let mut config = delay_config();
    config["hostname"] = json!(["example.com"]);
    let prepared = f.kit.prepare(&id, &request(config)).await.unwrap();
    assert_eq!(f.runner.runs()[0].stdin.as_deref(), Some("example.com A\nexample.com AAAA\n"));
    assert!(prepared.state.to_string().contains("93.184.216.34"));
}

#[tokio::test]
async fn test_stop_during_network_start_reverts_everything() {
    let f = fixture();
    let id = action_id("network_blackhole");
    let req = request(json!({
        "duration": 1000,
        "ip": ["10.2.0.0/16", "fd00::/8"],
        "failOnHostNetwork": false,
    }));
    let execution_id = req.execution_id;
    let prepared = f.kit.prepare(&id, &req).await.unwrap();

    // The stop lands while the first batch is being applied.
    let ctx = Arc::downgrade(f.kit.context());
    f.runner.on_run(move |_, _| {
        if let Some(ctx) = ctx.upgrade() {
            ctx.registry.cancel_pending(&execution_id).unwrap();
        }
        RunOutput {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    });
    let stopped = f.kit.stop(&id, &prepared.state);
    let started = f.kit.start(&id, &prepared.state);
    let (started, stopped) = tokio::join!(started, stopped);
    assert!(stopped.is_ok());
    assert!(matches!(started.unwrap_err(), Error::Cancelled(e) if e == execution_id));

    let runs = f.runner.runs();
    for family in ["-4", "-6"] {
        let scripts: Vec<&str> = runs
            .iter()
            .filter(|r| r.args[1] == family)
            .map(|r| r.stdin.as_deref().unwrap())
            .collect();
        let adds = scripts.iter().filter(|s| s.contains("rule add")).count();
        let dels = scripts.iter().filter(|s| s.contains("rule del")).count();
        assert_eq!(adds, 1, "ip {family}");
        assert_eq!(dels, adds, "ip {family}");
    }
    assert!(f.kit.context().network.active_namespaces().unwrap().is_empty());
    assert!(f.kit.context().registry.is_empty());
    assert!(bundles(&f.workdir).is_empty());
}

// =============================================================================
// Registry Edge Cases
// =============================================================================

#[tokio::test]
async fn test_status_and_stop_of_unknown_execution() {
    let f = fixture();
    let state = json!({"executionId": Uuid::new_v4()});
    let id = action_id("stress_cpu");
    assert!(f.kit.status(&id, &state).await.unwrap().completed);
    let stopped = f.kit.stop(&id, &state).await.unwrap();
    assert!(stopped.messages.is_empty());
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let f = fixture();
    let id = action_id("pause");
    let prepared = f.kit.prepare(&id, &request(json!({"duration": 1000}))).await.unwrap();
    f.kit.start(&id, &prepared.state).await.unwrap();
    assert!(f.kit.start(&id, &prepared.state).await.is_err());
    f.kit.stop(&id, &prepared.state).await.unwrap();
}
