//! # runc OCI Runner
//!
//! Implements [`OciRunner`] by invoking the `runc` binary with the state root
//! of the container runtime that owns the targets, so sidecars land next to
//! the containers they attack.
//!
//! ## Command Line
//!
//! ```text
//! runc --root <root> [--debug] [--rootless <auto|true|false>] [--systemd-cgroup] <verb> ...
//! ```
//!
//! | Operation | Verb                                   |
//! |-----------|----------------------------------------|
//! | create    | `create --bundle <bundle> <id>`        |
//! | start     | `start <id>`                           |
//! | run       | `run --bundle <bundle> <id>`           |
//! | state     | `state <id>`                           |
//! | kill      | `kill [--all] <id> <SIGNAL>`           |
//! | delete    | `delete [--force] <id>`                |
//!
//! Errors mentioning "does not exist" map to
//! [`Error::TargetNotFound`]; everything else is [`Error::RuntimeIo`] with
//! the tail of runc's stderr.

use crate::config::RuncConfig;
use crate::constants::{STDERR_TAIL_LEN, validate_container_id};
use crate::error::{Error, Result, stderr_tail};
use crate::runtime::{ContainerState, OciRunner, ProcessExit, RunOutput, RunningProcess, Signal};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// runc-backed sidecar runner.
#[derive(Debug, Clone)]
pub struct Runc {
    config: RuncConfig,
    binary: String,
}

impl Runc {
    /// Creates a runner using `runc` from `PATH`.
    pub fn new(config: RuncConfig) -> Self {
        Self {
            config,
            binary: "runc".to_string(),
        }
    }

    /// Uses a different runc binary.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Global flags preceding every verb.
    pub fn global_args(&self) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            self.config.root.display().to_string(),
        ];
        if self.config.debug {
            args.push("--debug".to_string());
        }
        if self.config.rootless != "auto" {
            args.push("--rootless".to_string());
            args.push(self.config.rootless.clone());
        }
        if self.config.systemd_cgroup {
            args.push("--systemd-cgroup".to_string());
        }
        args
    }

    fn command(&self, verb_args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.global_args()).args(verb_args);
        cmd
    }

    /// Runs a short-lived runc command and maps failures.
    async fn exec(&self, id: &str, verb_args: Vec<String>) -> Result<Vec<u8>> {
        debug!("{} {}", self.binary, verb_args.join(" "));
        let output = self
            .command(&verb_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::RuntimeIo {
                command: format!("{} {}", self.binary, verb_args.first().map(String::as_str).unwrap_or("")),
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(map_failure(&self.binary, &verb_args, id, &output.stderr))
    }
}

fn check_id(id: &str) -> Result<()> {
    validate_container_id(id)
        .map_err(|reason| Error::InvalidConfig(format!("invalid sidecar id '{id}': {reason}")))
}

fn map_failure(binary: &str, verb_args: &[String], id: &str, stderr: &[u8]) -> Error {
    let tail = stderr_tail(stderr, STDERR_TAIL_LEN);
    if is_not_exist(&tail) {
        return Error::TargetNotFound(id.to_string());
    }
    Error::RuntimeIo {
        command: format!(
            "{} {}",
            binary,
            verb_args.first().map(String::as_str).unwrap_or("")
        ),
        stderr: tail,
    }
}

/// Returns true if runc reported a missing container.
pub fn is_not_exist(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("not found")
}

#[async_trait]
impl OciRunner for Runc {
    fn name(&self) -> &str {
        "runc"
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        check_id(id)?;
        self.exec(
            id,
            vec![
                "create".to_string(),
                "--bundle".to_string(),
                bundle.display().to_string(),
                id.to_string(),
            ],
        )
        .await?;
        info!("created sidecar {}", id);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.exec(id, vec!["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn run(&self, id: &str, bundle: &Path, stdin: Option<Vec<u8>>) -> Result<RunOutput> {
        check_id(id)?;
        let verb_args = vec![
            "run".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
            id.to_string(),
        ];
        debug!("{} {}", self.binary, verb_args.join(" "));

        let mut child = self
            .command(&verb_args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::RuntimeIo {
                command: format!("{} run", self.binary),
                stderr: e.to_string(),
            })?;

        // Stdin is fed from its own task while the output pipes are drained.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(&input).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(sidecar = %id, "sidecar exited before reading all of stdin");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(Error::Internal(format!("stdin writer of {id} failed: {e}"))),
            }
        }
        Ok(RunOutput {
            exit_code: ProcessExit::code_of(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(&self, id: &str, bundle: &Path) -> Result<RunningProcess> {
        check_id(id)?;
        let verb_args = vec![
            "run".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
            id.to_string(),
        ];
        debug!("{} {} (background)", self.binary, verb_args.join(" "));

        let child = self
            .command(&verb_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::RuntimeIo {
                command: format!("{} run", self.binary),
                stderr: e.to_string(),
            })?;

        let (tx, rx) = watch::channel(None);
        let sidecar = id.to_string();
        tokio::spawn(async move {
            let exit = match child.wait_with_output().await {
                Ok(output) => {
                    let exit_code = ProcessExit::code_of(output.status);
                    if !output.stdout.is_empty() {
                        debug!(sidecar = %sidecar, "stdout: {}", String::from_utf8_lossy(&output.stdout).trim());
                    }
                    ProcessExit {
                        exit_code,
                        stderr: stderr_tail(&output.stderr, STDERR_TAIL_LEN),
                    }
                }
                Err(e) => {
                    warn!(sidecar = %sidecar, "failed to wait for sidecar: {}", e);
                    ProcessExit {
                        exit_code: crate::constants::EXIT_CODE_SIGNALED,
                        stderr: e.to_string(),
                    }
                }
            };
            info!(sidecar = %sidecar, exit_code = exit.exit_code, "sidecar exited");
            tx.send_replace(Some(exit));
        });

        Ok(RunningProcess::new(id, rx))
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let out = self.exec(id, vec!["state".to_string(), id.to_string()]).await?;
        Ok(serde_json::from_slice(&out)?)
    }

    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
        let mut args = vec!["kill".to_string()];
        if all {
            args.push("--all".to_string());
        }
        args.push(id.to_string());
        args.push(signal.name().to_string());
        self.exec(id, args).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        self.exec(id, args).await?;
        debug!("deleted sidecar {}", id);
        Ok(())
    }
}
