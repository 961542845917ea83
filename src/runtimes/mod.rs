//! OCI runner implementations.

pub mod runc;

pub use self::runc::Runc;

use crate::config::Config;
use crate::runtime::OciRunner;
use std::sync::Arc;

/// Creates the runner configured for the agent.
pub fn new_runner(config: &Config) -> Arc<dyn OciRunner> {
    Arc::new(Runc::new(config.runc.clone()))
}
