//! Battery readings and the sources that produce them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{PowerError, Result};

/// A single battery sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// Charge level in percent, 0-100.
    pub level: u8,
    /// Whether external power is connected.
    pub charging: bool,
}

impl BatteryReading {
    pub fn new(level: u8, charging: bool) -> Self {
        Self {
            level: level.min(100),
            charging,
        }
    }

    /// Reading used for devices without a battery.
    pub fn mains() -> Self {
        Self {
            level: 100,
            charging: true,
        }
    }
}

#[async_trait]
pub trait BatterySource: Send + Sync {
    async fn read(&self) -> Result<BatteryReading>;

    /// Push notifications for sources that know when they change.
    /// Polled sources return `None`.
    fn changes(&self) -> Option<watch::Receiver<BatteryReading>> {
        None
    }
}

/// Reads `/sys/class/power_supply`.
///
/// The first supply whose `type` is `Battery` provides the level. The device
/// counts as charging when that battery reports `Charging` or `Full`, or when
/// any other supply reports `online` = 1.
pub struct SysfsBattery {
    supply_dir: PathBuf,
}

impl SysfsBattery {
    pub fn new(supply_dir: impl Into<PathBuf>) -> Self {
        Self {
            supply_dir: supply_dir.into(),
        }
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

#[async_trait]
impl BatterySource for SysfsBattery {
    async fn read(&self) -> Result<BatteryReading> {
        let mut entries = fs::read_dir(&self.supply_dir).await?;
        let mut battery: Option<PathBuf> = None;
        let mut external_online = false;

        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let kind = read_trimmed(&dir.join("type")).await.unwrap_or_default();
            if kind == "Battery" {
                if battery.is_none() {
                    battery = Some(dir);
                }
            } else if read_trimmed(&dir.join("online")).await.as_deref() == Some("1") {
                trace!(supply = %dir.display(), "External supply online");
                external_online = true;
            }
        }

        let dir = battery
            .ok_or_else(|| PowerError::NoBattery(self.supply_dir.display().to_string()))?;

        let capacity_file = dir.join("capacity");
        let raw = fs::read_to_string(&capacity_file).await?;
        let level: u8 = raw.trim().parse().map_err(|_| PowerError::Parse {
            file: capacity_file.display().to_string(),
            value: raw.trim().to_string(),
        })?;

        let status = read_trimmed(&dir.join("status")).await.unwrap_or_default();
        let charging = matches!(status.as_str(), "Charging" | "Full") || external_online;

        debug!(level, charging, status = %status, "Read sysfs battery");
        Ok(BatteryReading::new(level, charging))
    }
}

/// Battery whose reading is set by hand. Used in development mode and tests.
pub struct ManualBattery {
    tx: watch::Sender<BatteryReading>,
}

impl ManualBattery {
    pub fn new(level: u8, charging: bool) -> Self {
        let (tx, _rx) = watch::channel(BatteryReading::new(level, charging));
        Self { tx }
    }

    pub fn set(&self, level: u8, charging: bool) {
        self.tx.send_replace(BatteryReading::new(level, charging));
    }

    pub fn set_level(&self, level: u8) {
        self.tx.send_modify(|r| r.level = level.min(100));
    }

    pub fn set_charging(&self, charging: bool) {
        self.tx.send_modify(|r| r.charging = charging);
    }
}

#[async_trait]
impl BatterySource for ManualBattery {
    async fn read(&self) -> Result<BatteryReading> {
        Ok(*self.tx.borrow())
    }

    fn changes(&self) -> Option<watch::Receiver<BatteryReading>> {
        Some(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supply(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            std::fs::write(dir.join(file), format!("{}\n", content)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_sysfs_discharging_battery() {
        let root = TempDir::new().unwrap();
        supply(
            root.path(),
            "battery",
            &[("type", "Battery"), ("capacity", "42"), ("status", "Discharging")],
        );
        supply(root.path(), "usb", &[("type", "USB"), ("online", "0")]);

        let reading = SysfsBattery::new(root.path()).read().await.unwrap();
        assert_eq!(reading, BatteryReading::new(42, false));
    }

    #[tokio::test]
    async fn test_sysfs_charging_via_external_supply() {
        let root = TempDir::new().unwrap();
        supply(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("capacity", "9"), ("status", "Not charging")],
        );
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);

        let reading = SysfsBattery::new(root.path()).read().await.unwrap();
        assert!(reading.charging);
        assert_eq!(reading.level, 9);
    }

    #[tokio::test]
    async fn test_sysfs_without_battery() {
        let root = TempDir::new().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);

        let err = SysfsBattery::new(root.path()).read().await;
        assert!(matches!(err, Err(PowerError::NoBattery(_))));
    }

    #[tokio::test]
    async fn test_sysfs_bad_capacity() {
        let root = TempDir::new().unwrap();
        supply(
            root.path(),
            "battery",
            &[("type", "Battery"), ("capacity", "lots")],
        );
        let err = SysfsBattery::new(root.path()).read().await;
        assert!(matches!(err, Err(PowerError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_manual_battery_notifies() {
        let battery = ManualBattery::new(50, false);
        let mut changes = battery.changes().unwrap();

        battery.set_charging(true);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), BatteryReading::new(50, true));
        assert_eq!(battery.read().await.unwrap().level, 50);
    }
}
