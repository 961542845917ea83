//! extension-container - fault injection agent CLI
//!
//! Runs the agent's operations locally against the configured container
//! runtime. Configuration comes from `STEADYBIT_EXTENSION_*` variables.
//!
//! ## Usage
//!
//! ```sh
//! extension-container discover
//! extension-container describe
//! extension-container attack com.steadybit.extension_container.network_delay \
//!     --container docker://4f66ad9a --config '{"networkDelay": 200}' --duration 30s
//! extension-container sweep
//! ```
//!
//! Logs go to stderr; `STEADYBIT_LOG_FORMAT=json` switches to JSON lines.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use extension_container::actions::{ActionRequest, Message, MessageLevel, TargetRef};
use extension_container::config::parse_duration;
use extension_container::runtimes::new_runner;
use extension_container::sidecar::sweep_orphans;
use extension_container::{ActionContext, ActionKit, Config, discover, new_client};
use serde_json::Value;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Interval between status polls of a running attack.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "extension-container")]
#[command(author, version, about = "Fault injection for OCI containers through sidecars")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attackable containers as JSON
    Discover,

    /// Print all action descriptions as JSON
    Describe,

    /// Run one attack: prepare, start, poll status, stop
    Attack {
        /// Action id
        action: String,

        /// Target container id (optionally runtime-prefixed)
        #[arg(short, long)]
        container: String,

        /// Action configuration as a JSON object
        #[arg(long, default_value = "{}")]
        config: String,

        /// Attack duration (`500ms`, `30s`, `5m`)
        #[arg(short, long, default_value = "30s")]
        duration: String,
    },

    /// Remove sidecar bundles left behind by a crashed agent
    Sweep,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("STEADYBIT_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_messages(messages: &[Message]) {
    for m in messages {
        match m.level {
            MessageLevel::Error => error!("{}", m.message),
            MessageLevel::Warn => warn!("{}", m.message),
            MessageLevel::Info | MessageLevel::Debug => info!("{}", m.message),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_discover(config: &Config) -> anyhow::Result<()> {
    let client = new_client(config);
    let targets = discover(client.as_ref(), config).await?;
    println!("{}", serde_json::to_string_pretty(&targets)?);
    Ok(())
}

fn cmd_describe(kit: &ActionKit) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&kit.describe_all())?);
    Ok(())
}

async fn cmd_attack(kit: &ActionKit, action: &str, container: &str, config: &str, duration: &str) -> anyhow::Result<()> {
    let duration = parse_duration(duration)?;
    let mut config: Value = serde_json::from_str(config).context("--config is not valid JSON")?;
    let Some(object) = config.as_object_mut() else {
        bail!("--config must be a JSON object");
    };
    object
        .entry("duration")
        .or_insert_with(|| Value::from(duration.as_millis() as u64));

    let request = ActionRequest::new(Uuid::new_v4(), TargetRef::container(container), config);
    info!(execution_id = %request.execution_id, "preparing {}", action);
    let prepared = kit.prepare(action, &request).await?;
    log_messages(&prepared.messages);
    if let Some(e) = prepared.error {
        bail!("{}", e.title);
    }
    let state = prepared.state;

    let started = kit.start(action, &state).await?;
    log_messages(&started.messages);

    let deadline = tokio::time::Instant::now() + duration;
    let mut completed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping attack");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                let status = kit.status(action, &state).await?;
                log_messages(&status.messages);
                if let Some(e) = &status.error {
                    error!("{}", e.title);
                }
                if status.completed {
                    completed = true;
                    break;
                }
            }
        }
    }

    let stopped = kit.stop(action, &state).await?;
    log_messages(&stopped.messages);
    info!(completed, "attack finished");
    Ok(())
}

async fn cmd_sweep(config: &Config) -> anyhow::Result<()> {
    let runner = new_runner(config);
    let removed = sweep_orphans(&config.workdir, runner.as_ref(), &HashSet::new()).await?;
    for id in &removed {
        println!("{id}");
    }
    info!("removed {} orphaned sidecars", removed.len());
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    match cli.command {
        Commands::Discover => cmd_discover(&config).await,
        Commands::Describe => {
            let kit = build_kit(config);
            cmd_describe(&kit)
        }
        Commands::Attack {
            action,
            container,
            config: action_config,
            duration,
        } => {
            let kit = build_kit(config);
            let result = cmd_attack(&kit, &action, &container, &action_config, &duration).await;
            kit.shutdown().await?;
            result
        }
        Commands::Sweep => cmd_sweep(&config).await,
    }
}

fn build_kit(config: Config) -> ActionKit {
    let client = new_client(&config);
    let runner = new_runner(&config);
    ActionKit::new(Arc::new(ActionContext::new(config, client, runner)))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
