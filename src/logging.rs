//! Tracing setup.
//!
//! Lifecycle transitions are emitted on the `rig_services::lifecycle` target, so
//! they can be filtered independently:
//!
//! ```bash
//! RUST_LOG=rig_services::lifecycle=info,rig_services=warn
//! ```

use crate::config::RigConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Target used for every lifecycle transition event.
pub const LIFECYCLE_TARGET: &str = "rig_services::lifecycle";

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log filter '{}': {}", level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Initialize tracing from the `[session]` section of the configuration.
pub fn init_from_config(config: &RigConfig) -> Result<()> {
    init(&config.session.log_level, config.session.json_logs)
}
