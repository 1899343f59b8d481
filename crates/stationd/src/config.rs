//! Loads the service configuration and applies command-line overrides.

use anyhow::{anyhow, Context, Result};
use station_core::ServiceConfig;
use tracing::debug;

use crate::cli::CliArgs;

/// Reads (or creates) the configuration file, applies the CLI overrides and
/// validates the result.
pub async fn load(args: &CliArgs) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_from_file(&args.config_path)
        .await
        .with_context(|| format!("loading {}", args.config_path.display()))?;
    apply_overrides(&mut config, args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;
    Ok(config)
}

pub fn apply_overrides(config: &mut ServiceConfig, args: &CliArgs) {
    if let Some(directory) = &args.directory {
        debug!("Server directory overridden to {}", directory.display());
        config.server.directory = directory.clone();
    }
    if let Some(bind) = &args.bind_address {
        config.server.rpc_bind = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}
