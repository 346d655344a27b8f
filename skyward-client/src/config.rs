//! Configuration management for the update daemon.
//!
//! Loaded from `/etc/skyward/updater.yaml` by default. Every section and
//! field has a default, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use skyward_engine::RecoveryPaths;
use skyward_power::PowerPolicy;

use crate::cli::Args;
use crate::update::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/skyward/updater.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub updates: UpdatesConfig,
    pub power: PowerConfig,
    pub engine: EngineConfig,
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref url) = args.manifest_url {
            self.updates.manifest_url = url.clone();
        }

        if args.dev {
            self.engine.kind = EngineKindConfig::Mock;
            self.power.source = BatterySourceConfig::Manual;
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.updates.manifest_url.trim().is_empty() {
            return Err("Manifest URL cannot be empty".to_string());
        }

        if parse_duration(&self.updates.check_interval).is_none() {
            return Err(format!(
                "Invalid check interval '{}'. Use format like '6h', '30m', '1d'",
                self.updates.check_interval
            ));
        }

        if self.updates.persist_every_bytes == 0 {
            return Err("updates.persist_every_bytes must be positive".to_string());
        }

        self.updates.retry.validate()?;
        self.power.policy().validate()?;

        if self.power.poll_interval_secs == 0 {
            return Err("power.poll_interval_secs must be positive".to_string());
        }

        Ok(())
    }
}

/// Update check and download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// URL of the build manifest
    pub manifest_url: String,

    /// How often to check for updates (e.g., "6h", "30m")
    pub check_interval: String,

    /// Start downloading as soon as an update is found
    pub auto_download: bool,

    /// Apply as soon as the payload is verified
    pub auto_apply: bool,

    /// Where payloads are downloaded
    pub download_dir: PathBuf,

    /// Where the store and the session record live
    pub state_dir: PathBuf,

    /// Journal the download offset every this many bytes
    pub persist_every_bytes: u64,

    pub retry: RetryPolicy,

    pub connect_timeout_secs: u64,

    /// Timeout for probing download source reachability
    pub reachability_timeout_ms: u64,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            manifest_url: "https://updates.skyward.dev/api/v1/latest.json".to_string(),
            check_interval: "6h".to_string(),
            auto_download: false,
            auto_apply: false,
            download_dir: PathBuf::from("/data/skyward/ota"),
            state_dir: PathBuf::from("/data/skyward/state"),
            persist_every_bytes: 4 * 1024 * 1024,
            retry: RetryPolicy::default(),
            connect_timeout_secs: 15,
            reachability_timeout_ms: 2000,
        }
    }
}

impl UpdatesConfig {
    /// Parse check interval string to duration
    pub fn check_interval_duration(&self) -> Duration {
        parse_duration(&self.check_interval).unwrap_or(Duration::from_secs(6 * 3600))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatterySourceConfig {
    #[default]
    Sysfs,
    /// Fixed full charge, adjustable at runtime. Used in dev mode.
    Manual,
}

/// Battery gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub source: BatterySourceConfig,
    pub min_start_percent: u8,
    pub min_start_percent_charging: u8,
    pub min_continue_percent: u8,
    pub poll_interval_secs: u64,
    pub supply_dir: PathBuf,
}

impl Default for PowerConfig {
    fn default() -> Self {
        let policy = PowerPolicy::default();
        Self {
            source: BatterySourceConfig::default(),
            min_start_percent: policy.min_start_percent,
            min_start_percent_charging: policy.min_start_percent_charging,
            min_continue_percent: policy.min_continue_percent,
            poll_interval_secs: 60,
            supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

impl PowerConfig {
    pub fn policy(&self) -> PowerPolicy {
        PowerPolicy {
            min_start_percent: self.min_start_percent,
            min_start_percent_charging: self.min_start_percent_charging,
            min_continue_percent: self.min_continue_percent,
        }
    }
}

/// Which update engine to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKindConfig {
    /// Probe the device at startup
    #[default]
    Auto,
    Ab,
    AOnly,
    /// In-memory engine for development
    Mock,
}

/// Update engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKindConfig,

    /// update_engine client used on A/B devices
    pub client_binary: PathBuf,

    /// Apply mode on A/B devices
    pub streaming: bool,

    /// File holding the kernel command line with the slot suffix
    pub slot_suffix_file: PathBuf,

    pub bootctl_binary: PathBuf,

    pub boot_mode_file: PathBuf,
    pub apply_mode_token: String,
    pub command_file: PathBuf,
    pub last_install_file: PathBuf,
    pub installer_command: Option<PathBuf>,
    pub reboot_binary: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let recovery = RecoveryPaths::default();
        Self {
            kind: EngineKindConfig::default(),
            client_binary: PathBuf::from("update_engine_client"),
            streaming: false,
            slot_suffix_file: PathBuf::from("/proc/cmdline"),
            bootctl_binary: PathBuf::from("bootctl"),
            boot_mode_file: recovery.boot_mode_file,
            apply_mode_token: recovery.apply_mode_token,
            command_file: recovery.command_file,
            last_install_file: recovery.last_install_file,
            installer_command: recovery.installer_command,
            reboot_binary: recovery.reboot_binary,
        }
    }
}

impl EngineConfig {
    pub fn recovery_paths(&self) -> RecoveryPaths {
        RecoveryPaths {
            boot_mode_file: self.boot_mode_file.clone(),
            apply_mode_token: self.apply_mode_token.clone(),
            command_file: self.command_file.clone(),
            last_install_file: self.last_install_file.clone(),
            installer_command: self.installer_command.clone(),
            reboot_binary: self.reboot_binary.clone(),
        }
    }
}

/// Device description files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub build_prop: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            build_prop: PathBuf::from("/system/build.prop"),
        }
    }
}

/// Parse a duration string like "30s", "1h", "30m", "1d"
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    // The unit is the last character, which need not be ASCII.
    let (unit_at, _) = s.char_indices().last()?;
    let (num, unit) = s.split_at(unit_at);
    let num: u64 = num.parse().ok()?;

    let seconds = match unit {
        "s" => num,
        "m" => num.checked_mul(60)?,
        "h" => num.checked_mul(3600)?,
        "d" => num.checked_mul(86400)?,
        _ => return None,
    };

    Some(Duration::from_secs(seconds))
}
