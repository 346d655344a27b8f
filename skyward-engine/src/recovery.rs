//! File and command backed platform control.
//!
//! - [`FileRecoveryControl`]: recovery command file and `last_install`
//!   result marker for A-only devices.
//! - [`BootctlControl`]: kernel command line slot suffix and the `bootctl`
//!   tool for A/B devices.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::traits::{BootControl, RecoveryControl};
use crate::types::{error_code, ResultMarker, Slot};

/// Parse a `last_install` marker.
///
/// Line one is the package path, line two is `1` on success and `0` on
/// failure. An optional `error: N` line carries the failure code.
pub fn parse_last_install(content: &str) -> Option<ResultMarker> {
    let mut lines = content.lines().map(str::trim);
    let path = lines.next().filter(|l| !l.is_empty()).map(PathBuf::from);
    let outcome = lines.next()?;

    let mut code = match outcome {
        "1" => error_code::SUCCESS,
        "0" => error_code::ERROR,
        _ => return None,
    };
    if code != error_code::SUCCESS {
        for line in lines {
            if let Some(value) = line.strip_prefix("error:") {
                if let Ok(parsed) = value.trim().parse::<i32>() {
                    code = parsed;
                }
            }
        }
    }

    Some(ResultMarker {
        payload: path,
        error_code: code,
    })
}

fn render_last_install(payload: &Path, code: i32) -> String {
    if code == error_code::SUCCESS {
        format!("{}\n1\n", payload.display())
    } else {
        format!("{}\n0\nerror: {}\n", payload.display(), code)
    }
}

async fn run_checked(program: &Path, args: &[String]) -> Result<()> {
    let status = Command::new(program).args(args).status().await.map_err(|e| {
        EngineError::Unavailable(format!("failed to run {}: {}", program.display(), e))
    })?;
    if !status.success() {
        return Err(EngineError::Unavailable(format!(
            "{} {} exited with {}",
            program.display(),
            args.join(" "),
            status
        )));
    }
    Ok(())
}

/// Settings for [`FileRecoveryControl`].
#[derive(Debug, Clone)]
pub struct RecoveryPaths {
    /// File whose contents reveal the current boot mode.
    pub boot_mode_file: PathBuf,
    /// Token present in `boot_mode_file` while in the apply mode.
    pub apply_mode_token: String,
    pub command_file: PathBuf,
    pub last_install_file: PathBuf,
    /// Installer run from the apply mode. Recovery images that install on
    /// their own leave this unset.
    pub installer_command: Option<PathBuf>,
    pub reboot_binary: PathBuf,
}

impl Default for RecoveryPaths {
    fn default() -> Self {
        Self {
            boot_mode_file: PathBuf::from("/proc/cmdline"),
            apply_mode_token: "androidboot.mode=recovery".to_string(),
            command_file: PathBuf::from("/cache/recovery/command"),
            last_install_file: PathBuf::from("/cache/recovery/last_install"),
            installer_command: None,
            reboot_binary: PathBuf::from("reboot"),
        }
    }
}

pub struct FileRecoveryControl {
    paths: RecoveryPaths,
}

impl FileRecoveryControl {
    pub fn new(paths: RecoveryPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl RecoveryControl for FileRecoveryControl {
    async fn in_apply_mode(&self) -> Result<bool> {
        let content = fs::read_to_string(&self.paths.boot_mode_file).await?;
        Ok(content
            .split_whitespace()
            .any(|token| token == self.paths.apply_mode_token))
    }

    #[instrument(skip(self), fields(payload = %payload.display()))]
    async fn reboot_into_apply_mode(&self, payload: &Path) -> Result<()> {
        if let Some(parent) = self.paths.command_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(
            &self.paths.command_file,
            format!("--update_package={}\n", payload.display()),
        )
        .await?;
        info!(command_file = %self.paths.command_file.display(), "Staged recovery command");

        run_checked(&self.paths.reboot_binary, &["recovery".to_string()]).await
    }

    #[instrument(skip(self), fields(payload = %payload.display()))]
    async fn install(&self, payload: &Path) -> Result<()> {
        let installer = self
            .paths
            .installer_command
            .as_ref()
            .ok_or(EngineError::Unsupported {
                engine: "a_only",
                operation: "install without an installer command",
            })?;

        let status = Command::new(installer)
            .arg(payload)
            .status()
            .await
            .map_err(|e| {
                EngineError::Unavailable(format!("failed to run {}: {}", installer.display(), e))
            })?;

        let code = match status.code() {
            Some(0) => error_code::SUCCESS,
            Some(code) => code,
            None => error_code::ERROR,
        };
        if code != error_code::SUCCESS {
            warn!(code, "Installer reported failure");
        }

        if let Some(parent) = self.paths.last_install_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(
            &self.paths.last_install_file,
            render_last_install(payload, code),
        )
        .await?;
        Ok(())
    }

    async fn read_result_marker(&self) -> Result<Option<ResultMarker>> {
        match fs::read_to_string(&self.paths.last_install_file).await {
            Ok(content) => {
                let marker = parse_last_install(&content);
                if marker.is_none() {
                    warn!(
                        path = %self.paths.last_install_file.display(),
                        "Ignoring malformed install marker"
                    );
                }
                Ok(marker)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_result_marker(&self) -> Result<()> {
        match fs::remove_file(&self.paths.last_install_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reboot_to_normal(&self) -> Result<()> {
        if !self.in_apply_mode().await? {
            return Ok(());
        }
        let _ = fs::remove_file(&self.paths.command_file).await;
        run_checked(&self.paths.reboot_binary, &[]).await
    }
}

/// A/B slot control through `bootctl`. The booted slot is read from a file
/// holding either a kernel command line or a bare slot suffix.
pub struct BootctlControl {
    cmdline: PathBuf,
    bootctl: PathBuf,
    boot_id: PathBuf,
}

/// Kernel-provided random id, regenerated on every boot.
pub const KERNEL_BOOT_ID: &str = "/proc/sys/kernel/random/boot_id";

impl BootctlControl {
    pub fn new(cmdline: impl Into<PathBuf>, bootctl: impl Into<PathBuf>) -> Self {
        Self {
            cmdline: cmdline.into(),
            bootctl: bootctl.into(),
            boot_id: PathBuf::from(KERNEL_BOOT_ID),
        }
    }

    pub fn with_boot_id_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.boot_id = path.into();
        self
    }
}

/// Find `androidboot.slot_suffix=_x` on a kernel command line.
pub fn slot_from_cmdline(cmdline: &str) -> Option<Slot> {
    cmdline
        .split_whitespace()
        .find_map(|token| token.strip_prefix("androidboot.slot_suffix="))
        .and_then(Slot::from_suffix)
}

#[async_trait]
impl BootControl for BootctlControl {
    async fn current_slot(&self) -> Result<Slot> {
        let content = fs::read_to_string(&self.cmdline).await?;
        slot_from_cmdline(&content)
            .or_else(|| Slot::from_suffix(&content))
            .ok_or_else(|| {
            EngineError::Protocol(format!(
                "no slot suffix in {}",
                self.cmdline.display()
            ))
        })
    }

    async fn set_active_boot_slot(&self, slot: Slot) -> Result<()> {
        run_checked(
            &self.bootctl,
            &["set-active-boot-slot".to_string(), slot.index().to_string()],
        )
        .await
    }

    async fn mark_boot_successful(&self) -> Result<()> {
        run_checked(&self.bootctl, &["mark-boot-successful".to_string()]).await
    }

    async fn boot_id(&self) -> Result<String> {
        let id = fs::read_to_string(&self.boot_id).await?;
        let id = id.trim();
        if id.is_empty() {
            return Err(EngineError::Protocol(format!(
                "empty boot id in {}",
                self.boot_id.display()
            )));
        }
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir, cmdline: &str) -> RecoveryPaths {
        let boot_mode_file = dir.path().join("cmdline");
        std::fs::write(&boot_mode_file, cmdline).unwrap();
        RecoveryPaths {
            boot_mode_file,
            command_file: dir.path().join("recovery/command"),
            last_install_file: dir.path().join("recovery/last_install"),
            ..RecoveryPaths::default()
        }
    }

    #[test]
    fn test_parse_last_install() {
        let ok = parse_last_install("/cache/update.zip\n1\n").unwrap();
        assert!(ok.succeeded());
        assert_eq!(ok.payload, Some(PathBuf::from("/cache/update.zip")));

        let failed = parse_last_install("/cache/update.zip\n0\nretry: 0\nerror: 21\n").unwrap();
        assert_eq!(failed.error_code, 21);

        let bare = parse_last_install("/cache/update.zip\n0\n").unwrap();
        assert_eq!(bare.error_code, error_code::ERROR);

        assert_eq!(parse_last_install("/cache/update.zip\n"), None);
        assert_eq!(parse_last_install("/cache/update.zip\nmaybe\n"), None);
    }

    #[test]
    fn test_slot_from_cmdline() {
        let cmdline = "console=ttyS0 androidboot.slot_suffix=_b quiet";
        assert_eq!(slot_from_cmdline(cmdline), Some(Slot::B));
        assert_eq!(slot_from_cmdline("console=ttyS0"), None);
    }

    #[tokio::test]
    async fn test_apply_mode_detection() {
        let dir = TempDir::new().unwrap();
        let normal = FileRecoveryControl::new(paths(&dir, "console=ttyS0 quiet"));
        assert!(!normal.in_apply_mode().await.unwrap());

        let dir = TempDir::new().unwrap();
        let apply = FileRecoveryControl::new(paths(&dir, "androidboot.mode=recovery quiet\n"));
        assert!(apply.in_apply_mode().await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_read_and_clear() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir, "quiet");
        let control = FileRecoveryControl::new(p.clone());

        assert_eq!(control.read_result_marker().await.unwrap(), None);

        std::fs::create_dir_all(p.last_install_file.parent().unwrap()).unwrap();
        std::fs::write(
            &p.last_install_file,
            render_last_install(Path::new("/cache/u.zip"), 0),
        )
        .unwrap();
        let marker = control.read_result_marker().await.unwrap().unwrap();
        assert!(marker.succeeded());

        control.clear_result_marker().await.unwrap();
        control.clear_result_marker().await.unwrap();
        assert_eq!(control.read_result_marker().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_without_installer_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let control = FileRecoveryControl::new(paths(&dir, "androidboot.mode=recovery"));
        let err = control.install(Path::new("/cache/u.zip")).await;
        assert!(matches!(err, Err(EngineError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_bootctl_reads_slot_and_boot_id() {
        let dir = TempDir::new().unwrap();
        let cmdline = dir.path().join("cmdline");
        let boot_id = dir.path().join("boot_id");
        std::fs::write(&cmdline, "quiet androidboot.slot_suffix=_a\n").unwrap();
        std::fs::write(&boot_id, "3f2c9a4e-1b7d-4c1e-9d55-0c4e8b1f6a21\n").unwrap();

        let control = BootctlControl::new(&cmdline, "/nonexistent/bootctl")
            .with_boot_id_file(&boot_id);
        assert_eq!(control.current_slot().await.unwrap(), Slot::A);
        assert_eq!(
            control.boot_id().await.unwrap(),
            "3f2c9a4e-1b7d-4c1e-9d55-0c4e8b1f6a21"
        );

        std::fs::write(&boot_id, "\n").unwrap();
        assert!(matches!(
            control.boot_id().await,
            Err(EngineError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_reboot_to_normal_is_noop_outside_apply_mode() {
        let dir = TempDir::new().unwrap();
        let mut p = paths(&dir, "quiet");
        p.reboot_binary = PathBuf::from("/nonexistent/reboot");
        let control = FileRecoveryControl::new(p);
        control.reboot_to_normal().await.unwrap();
    }
}
