//! Command-line argument parsing.

use clap::Parser;

/// skyward-updater - OTA update client daemon
#[derive(Parser, Debug, Default)]
#[command(name = "skyward-updater")]
#[command(about = "skyward-updater - OTA update client daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Enable development mode (mock engine, manual battery)
    #[arg(long)]
    pub dev: bool,

    /// Manifest URL, overrides the config file
    #[arg(long, env = "SKYWARD_MANIFEST_URL")]
    pub manifest_url: Option<String>,

    /// Run a single check, print the outcome and exit
    #[arg(long)]
    pub check_only: bool,
}
