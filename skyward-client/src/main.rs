//! # skyward-updater
//!
//! OTA update client daemon. Checks the build manifest on a schedule,
//! downloads and verifies payloads and applies them through the device's
//! update engine.
//!
//! ## Usage
//! ```bash
//! skyward-updater --config /etc/skyward/updater.yaml
//! skyward-updater --dev --manifest-url http://localhost:9000/latest.json
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use skyward_client::cli::Args;
use skyward_client::config::{Config, DEFAULT_CONFIG_PATH};
use skyward_client::daemon;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        skyward_common::init_logging_json(&args.log_level)?;
    } else {
        skyward_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting skyward update daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to defaults
            match Config::load(DEFAULT_CONFIG_PATH) {
                Ok(cfg) => {
                    info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default().with_cli_overrides(&args)
                }
            }
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }

    info!(
        manifest = %config.updates.manifest_url,
        engine = ?config.engine.kind,
        "Update daemon configured"
    );

    if let Err(e) = daemon::run(config, args.check_only).await {
        error!(error = %e, "Update daemon failed");
        return Err(e);
    }

    Ok(())
}
