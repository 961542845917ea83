//! # extension-container
//!
//! **Host-resident fault injection for OCI containers**
//!
//! The agent attacks a running container without modifying it: every fault
//! is injected by a short-lived *sidecar* container that joins selected
//! namespaces and the cgroup of the target and runs a single Linux utility.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        extension-container                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  ActionKit / Action Trait                   │    │
//! │  │      prepare(request) → start(state) → status → stop        │    │
//! │  │                 ExecutionRegistry (by UUID)                 │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │           │                    │                     │              │
//! │  ┌────────┴───────┐  ┌─────────┴─────────┐  ┌────────┴─────────┐    │
//! │  │ Runtime Client │  │  Network Compiler │  │ Limit Adaptation │    │
//! │  │ docker / ctr / │  │ ip rule · tc u32  │  │ cgroup v1 / v2   │    │
//! │  │ crictl         │  │ port masks · dig  │  │ cpu · memory     │    │
//! │  └────────────────┘  └─────────┬─────────┘  └────────┬─────────┘    │
//! │                                │                     │              │
//! │  ┌─────────────────────────────┴─────────────────────┴───────────┐  │
//! │  │                         Sidecars                              │  │
//! │  │  bundle (rootfs + config.json) → runc run → stop → delete     │  │
//! │  │  joins /proc/<pid>/ns/* · child cgroup · target bind mounts   │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Sidecar Lifecycle
//!
//! ```text
//!   ┌─────────┐  create bundle  ┌──────────┐   runc run   ┌─────────┐
//!   │ (none)  │ ──────────────► │ Prepared │ ───────────► │ Running │
//!   └─────────┘                 └────┬─────┘              └────┬────┘
//!                                    │ failure                 │ SIGINT → SIGTERM → SIGKILL
//!                                    ▼                         ▼
//!                               ┌─────────┐   delete +    ┌─────────┐
//!                               │ Removed │ ◄──────────── │ Stopped │
//!                               └─────────┘ remove bundle └─────────┘
//! ```
//!
//! # Invariants
//!
//! - A failed start leaves no registry entry and no bundle behind.
//! - At most one network fault is active per network namespace.
//! - Every applied network change is reverted by replaying the recorded
//!   inverse commands, unless the namespace is gone.
//! - Stop is idempotent; status after stop reports completed.
//!
//! # Example
//!
//! ```rust,ignore
//! use extension_container::{ActionContext, ActionKit, Config, Runc, new_client};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> extension_container::Result<()> {
//!     let config = Config::from_env()?;
//!     let client = new_client(&config);
//!     let runner = Arc::new(Runc::new(config.runc.clone()));
//!     let kit = ActionKit::new(Arc::new(ActionContext::new(config, client, runner)));
//!     for action in kit.describe_all() {
//!         println!("{}", action.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod bundle;
pub mod cgroup;
pub mod client;
pub mod config;
pub mod constants;
pub mod diskfill;
pub mod diskusage;
pub mod discovery;
pub mod error;
pub mod introspect;
pub mod memfill;
pub mod network;
pub mod registry;
pub mod runtime;
pub mod runtimes;
pub mod sidecar;
pub mod stress;

#[doc(hidden)]
pub mod testing;

// Re-exports
pub use actions::{Action, ActionContext, ActionKit, ActionRequest, TargetRef};
pub use bundle::{Bundle, BundleBuilder, SpecEdit};
pub use client::{ContainerInfo, ContainerRuntimeClient, RuntimeKind, new_client};
pub use config::Config;
pub use discovery::{Target, discover};
pub use error::{Error, Result};
pub use introspect::{NamespaceKind, TargetProcess};
pub use network::{Filter, NetworkManager, NetworkOpts};
pub use registry::ExecutionRegistry;
pub use runtime::{OciRunner, ProcessExit, RunOutput, Signal};
pub use runtimes::Runc;
pub use sidecar::{SidecarOpts, SidecarSpec, Sidecars};
