//! Sidecar bundles: one-shot runs, spawn/stop and orphan sweeping.

use extension_container::introspect::NamespaceKind;
use extension_container::runtime::OciRunner;
use extension_container::sidecar::sweep_orphans;
use extension_container::testing::FakeOciRunner;
use extension_container::{
    Bundle, BundleBuilder, Error, RunOutput, SidecarOpts, SidecarSpec, Sidecars, TargetProcess,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const PID: u32 = 77;

struct Env {
    temp: TempDir,
    runner: Arc<FakeOciRunner>,
    sidecars: Sidecars,
}

impl Env {
    fn workdir(&self) -> std::path::PathBuf {
        self.temp.path().join("work")
    }

    fn opts(&self, execution_id: Uuid) -> SidecarOpts {
        let target = TargetProcess::inspect(&self.temp.path().join("proc"), PID).unwrap();
        SidecarOpts::new(target, "docker://0123456789abcdef", execution_id)
    }

    fn bundles(&self) -> usize {
        fs::read_dir(self.workdir()).unwrap().count()
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn env() -> Env {
    let temp = TempDir::new().unwrap();
    let proc_root = temp.path().join("proc");
    for ns in ["pid", "net", "uts"] {
        write(&proc_root.join(format!("{PID}/ns/{ns}")), "");
    }
    write(&proc_root.join(format!("{PID}/cgroup")), "0::/system.slice/docker-0123.scope\n");
    write(&temp.path().join("image/bin/ip"), "");
    fs::create_dir_all(temp.path().join("work")).unwrap();

    let runner = Arc::new(FakeOciRunner::new());
    let builder = BundleBuilder::new(temp.path().join("work"), temp.path().join("image"))
        .with_proc_root(&proc_root);
    let sidecars = Sidecars::new(builder, runner.clone(), true);
    Env {
        temp,
        runner,
        sidecars,
    }
}

fn ip_spec() -> SidecarSpec {
    SidecarSpec::new("network", ["ip", "-json", "link", "show"])
        .with_namespaces(&[NamespaceKind::Net])
        .in_cgroup("network")
}

// =============================================================================
// One-Shot Runs
// =============================================================================

#[tokio::test]
async fn test_run_to_completion_removes_bundle() {
    let env = env();
    env.runner.on_run(|_, _| RunOutput {
        exit_code: 0,
        stdout: b"[]".to_vec(),
        stderr: Vec::new(),
    });
    let output = env
        .sidecars
        .run_to_completion(&env.opts(Uuid::new_v4()), &ip_spec(), None)
        .await
        .unwrap();
    assert_eq!(output.stdout_text(), "[]");
    assert_eq!(env.bundles(), 0);

    let runs = env.runner.runs();
    assert!(runs[0].id.starts_with("sb-network-"));
    assert!(runs[0].id.ends_with("-01234567"));
    assert!(env.runner.calls().iter().any(|c| c.starts_with("delete sb-network-")));
}

#[tokio::test]
async fn test_failed_run_reports_stderr() {
    let env = env();
    env.runner.on_run(|_, _| RunOutput {
        exit_code: 1,
        stdout: Vec::new(),
        stderr: b"Cannot find device \"eth9\"".to_vec(),
    });
    let err = env
        .sidecars
        .run_to_completion(&env.opts(Uuid::new_v4()), &ip_spec(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeIo { .. }));
    assert!(err.to_string().contains("eth9"));
    assert_eq!(env.bundles(), 0);
}

#[tokio::test]
async fn test_missing_namespace_fails_before_run() {
    let env = env();
    let spec = ip_spec().with_namespaces(&[NamespaceKind::Ipc]);
    let err = env
        .sidecars
        .run_to_completion(&env.opts(Uuid::new_v4()), &spec, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NamespaceUnavailable { .. }));
    assert!(env.runner.runs().is_empty());
    assert_eq!(env.bundles(), 0);
}

// =============================================================================
// Long-Running Sidecars
// =============================================================================

#[tokio::test]
async fn test_spawned_sidecar_spec() {
    let env = env();
    let spec = SidecarSpec::new("stress", ["stress-ng", "--cpu", "1"])
        .with_namespaces(&[NamespaceKind::Pid, NamespaceKind::Uts])
        .in_cgroup("stress")
        .with_capabilities(&["CAP_SYS_RESOURCE"]);
    let mut sidecar = env.sidecars.spawn(&env.opts(Uuid::new_v4()), &spec).await.unwrap();

    let bundle = Bundle::load(&env.workdir().join(sidecar.id())).unwrap();
    let config = bundle.spec();
    assert_eq!(config.process.args, vec!["stress-ng", "--cpu", "1"]);
    // A joined uts namespace keeps the target's hostname.
    assert!(config.hostname.is_none());
    assert!(config.root.readonly);
    let linux = config.linux.as_ref().unwrap();
    assert_eq!(linux.cgroups_path.as_deref(), Some("system.slice:sb:stress"));
    assert!(config.namespace("pid").unwrap().path.as_deref().unwrap().ends_with("/ns/pid"));

    env.sidecars.stop(&mut sidecar).await.unwrap();
    assert!(sidecar.is_released());
    assert_eq!(env.bundles(), 0);
    // Stopping again is a no-op.
    env.sidecars.stop(&mut sidecar).await.unwrap();
}

// =============================================================================
// Sweeping
// =============================================================================

#[tokio::test]
async fn test_cleanup_execution_only_removes_its_sidecars() {
    let env = env();
    let mine = Uuid::new_v4();
    let spec = SidecarSpec::new("stress", ["stress-ng"]).with_namespaces(&[NamespaceKind::Pid]);
    let _a = env.sidecars.spawn(&env.opts(mine), &spec).await.unwrap();
    let b = env.sidecars.spawn(&env.opts(Uuid::new_v4()), &spec).await.unwrap();

    let removed = env.sidecars.cleanup_execution(mine).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(env.bundles(), 1);
    assert!(env.workdir().join(b.id()).exists());
}

#[tokio::test]
async fn test_sweep_orphans_keeps_live_ids() {
    let env = env();
    let spec = SidecarSpec::new("stress", ["stress-ng"]).with_namespaces(&[NamespaceKind::Pid]);
    let live = env.sidecars.spawn(&env.opts(Uuid::new_v4()), &spec).await.unwrap();
    let _orphan = env.sidecars.spawn(&env.opts(Uuid::new_v4()), &spec).await.unwrap();
    fs::create_dir_all(env.workdir().join("not-a-sidecar")).unwrap();

    let keep: HashSet<String> = [live.id().to_string()].into();
    let runner: &dyn OciRunner = env.runner.as_ref();
    let removed = sweep_orphans(&env.workdir(), runner, &keep).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(env.workdir().join(live.id()).exists());
    assert!(env.workdir().join("not-a-sidecar").exists());

    let none = sweep_orphans(&env.temp.path().join("missing"), runner, &keep).await.unwrap();
    assert!(none.is_empty());
}
