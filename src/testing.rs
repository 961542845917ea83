//! In-memory runtime client and OCI runner for tests.
//!
//! Both fakes record every call so tests can assert on what the engine did.
//! The runner reads the args of each sidecar from its `config.json`, which
//! lets tests check generated command lines and batch scripts.

use crate::bundle::Bundle;
use crate::client::{ContainerInfo, ContainerRuntimeClient, RuntimeKind};
use crate::constants::EXIT_CODE_SIGNALED;
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerState, ContainerStatus, OciRunner, ProcessExit, RunOutput, RunningProcess, Signal,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Fake Runtime Client
// =============================================================================

/// A container runtime holding containers in memory.
#[derive(Debug, Default)]
pub struct FakeRuntimeClient {
    containers: Mutex<HashMap<String, (ContainerInfo, u32)>>,
    calls: Mutex<Vec<String>>,
    stop_delay: Mutex<Duration>,
    stop_error: Mutex<Option<String>>,
}

impl FakeRuntimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running container whose init process is `pid`.
    pub fn add(&self, info: ContainerInfo, pid: u32) {
        locked(&self.containers).insert(info.id.clone(), (info, pid));
    }

    /// Makes `stop` take `delay` before it returns.
    pub fn set_stop_delay(&self, delay: Duration) {
        *locked(&self.stop_delay) = delay;
    }

    /// Makes `stop` fail with `message`.
    pub fn set_stop_error(&self, message: &str) {
        *locked(&self.stop_error) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }

    fn lookup(&self, id: &str) -> Result<(ContainerInfo, u32)> {
        locked(&self.containers)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntimeClient for FakeRuntimeClient {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    fn socket(&self) -> &Path {
        Path::new("/var/run/fake.sock")
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut list: Vec<_> = locked(&self.containers)
            .values()
            .map(|(info, _)| info.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        Ok(self.lookup(id)?.0)
    }

    async fn get_pid(&self, id: &str) -> Result<u32> {
        Ok(self.lookup(id)?.1)
    }

    async fn stop(&self, id: &str, graceful: bool) -> Result<()> {
        self.record(format!("stop {id} graceful={graceful}"));
        self.lookup(id)?;
        let delay = *locked(&self.stop_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = locked(&self.stop_error).clone() {
            return Err(Error::RuntimeIo {
                command: "stop".to_string(),
                stderr: message,
            });
        }
        if let Some((info, _)) = locked(&self.containers).get_mut(id) {
            info.running = false;
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.record(format!("pause {id}"));
        self.lookup(id).map(|_| ())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.record(format!("unpause {id}"));
        self.lookup(id).map(|_| ())
    }

    async fn version(&self) -> Result<String> {
        Ok("1.0.0-fake".to_string())
    }
}

// =============================================================================
// Fake OCI Runner
// =============================================================================

type RunHandler = Box<dyn Fn(&[String], Option<&[u8]>) -> RunOutput + Send + Sync>;

/// One sidecar the fake runner was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// An OCI runner that never starts processes.
///
/// One-shot runs succeed with empty output unless a handler is installed.
/// Spawned sidecars stay running until [`FakeOciRunner::exit`] or a kill.
pub struct FakeOciRunner {
    handler: Mutex<Option<RunHandler>>,
    runs: Mutex<Vec<RunRecord>>,
    spawned: Mutex<Vec<RunRecord>>,
    running: Mutex<HashMap<String, watch::Sender<Option<ProcessExit>>>>,
    bundles: Mutex<HashMap<String, PathBuf>>,
    calls: Mutex<Vec<String>>,
    spawn_exit: Mutex<Option<ProcessExit>>,
}

impl Default for FakeOciRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOciRunner {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            spawn_exit: Mutex::new(None),
        }
    }

    /// Answers one-shot runs with `handler(args, stdin)`.
    pub fn on_run<F>(&self, handler: F)
    where
        F: Fn(&[String], Option<&[u8]>) -> RunOutput + Send + Sync + 'static,
    {
        *locked(&self.handler) = Some(Box::new(handler));
    }

    /// Makes spawned sidecars exit immediately with `exit`.
    pub fn exit_on_spawn(&self, exit: ProcessExit) {
        *locked(&self.spawn_exit) = Some(exit);
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        locked(&self.runs).clone()
    }

    pub fn spawned(&self) -> Vec<RunRecord> {
        locked(&self.spawned).clone()
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    /// Ids of spawned sidecars that have not been deleted.
    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<_> = locked(&self.running).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ends every live sidecar whose id starts with `sb-<kind>-`.
    pub fn exit(&self, kind: &str, exit: ProcessExit) -> usize {
        let prefix = format!("sb-{kind}-");
        let running = locked(&self.running);
        let mut n = 0;
        for (id, tx) in running.iter() {
            if id.starts_with(&prefix) && tx.borrow().is_none() {
                tx.send_replace(Some(exit.clone()));
                n += 1;
            }
        }
        n
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }

    fn describe(id: &str, bundle: &Path, stdin: Option<&[u8]>) -> Result<RunRecord> {
        let loaded = Bundle::load(bundle)?;
        Ok(RunRecord {
            id: id.to_string(),
            args: loaded.spec().process.args.clone(),
            stdin: stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
        })
    }
}

#[async_trait]
impl OciRunner for FakeOciRunner {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        self.record(format!("create {id}"));
        locked(&self.bundles).insert(id.to_string(), bundle.to_path_buf());
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {id}"));
        Ok(())
    }

    async fn run(&self, id: &str, bundle: &Path, stdin: Option<Vec<u8>>) -> Result<RunOutput> {
        self.record(format!("run {id}"));
        let record = Self::describe(id, bundle, stdin.as_deref())?;
        let output = match &*locked(&self.handler) {
            Some(handler) => handler(&record.args, stdin.as_deref()),
            None => RunOutput::default(),
        };
        locked(&self.runs).push(record);
        Ok(output)
    }

    async fn spawn(&self, id: &str, bundle: &Path) -> Result<RunningProcess> {
        self.record(format!("spawn {id}"));
        let record = Self::describe(id, bundle, None)?;
        locked(&self.spawned).push(record);
        let (tx, rx) = watch::channel(locked(&self.spawn_exit).clone());
        locked(&self.running).insert(id.to_string(), tx);
        Ok(RunningProcess::new(id, rx))
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let running = locked(&self.running);
        let tx = running
            .get(id)
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;
        let status = if tx.borrow().is_some() {
            ContainerStatus::Stopped
        } else {
            ContainerStatus::Running
        };
        let bundle = locked(&self.bundles)
            .get(id)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Ok(ContainerState::new(id, bundle, status))
    }

    async fn kill(&self, id: &str, signal: Signal, _all: bool) -> Result<()> {
        self.record(format!("kill {id} {signal}"));
        let running = locked(&self.running);
        let tx = running
            .get(id)
            .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;
        if tx.borrow().is_none() {
            tx.send_replace(Some(ProcessExit {
                exit_code: EXIT_CODE_SIGNALED,
                stderr: String::new(),
            }));
        }
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<()> {
        self.record(format!("delete {id}"));
        locked(&self.running).remove(id);
        locked(&self.bundles).remove(id);
        Ok(())
    }
}
