//! Shared types for the update engine adapters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform status codes reported by the A/B apply mechanism.
pub mod status_code {
    pub const IDLE: i32 = 0;
    pub const CHECKING_FOR_UPDATE: i32 = 1;
    pub const UPDATE_AVAILABLE: i32 = 2;
    pub const DOWNLOADING: i32 = 3;
    pub const VERIFYING: i32 = 4;
    pub const FINALIZING: i32 = 5;
    pub const UPDATED_NEED_REBOOT: i32 = 6;
    pub const REPORTING_ERROR_EVENT: i32 = 7;
    pub const ATTEMPTING_ROLLBACK: i32 = 8;
    pub const DISABLED: i32 = 9;
    pub const CLEANUP_PREVIOUS_UPDATE: i32 = 10;
    pub const UPDATED_BUT_NOT_ACTIVE: i32 = 11;
}

/// Platform error codes delivered with the completion callback.
pub mod error_code {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const DOWNLOAD_TRANSFER_ERROR: i32 = 9;
    pub const PAYLOAD_HASH_MISMATCH: i32 = 10;
    pub const PAYLOAD_SIZE_MISMATCH: i32 = 11;
    pub const USER_CANCELED: i32 = 48;
    pub const UPDATED_BUT_NOT_ACTIVE: i32 = 52;
    pub const NOT_ENOUGH_SPACE: i32 = 60;
    pub const DEVICE_CORRUPTED: i32 = 61;
}

/// Which apply flow the device supports. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Two system slots; apply to the inactive slot while running.
    #[serde(rename = "ab")]
    AB,
    /// Single system slot; apply from a special boot mode.
    AOnly,
}

impl EngineKind {
    pub fn label(&self) -> &'static str {
        match self {
            EngineKind::AB => "ab",
            EngineKind::AOnly => "a_only",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the payload is handed to the A/B mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// The mechanism pulls the payload from a URL itself.
    Streaming,
    /// The mechanism reads an already downloaded local file.
    #[default]
    BlockBased,
}

/// Terminal outcome of an apply operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyResult {
    Succeeded,
    Failed { code: i32 },
    NeedsReboot,
}

impl ApplyResult {
    /// Succeeded and NeedsReboot both mean the new build is staged.
    pub fn is_success(&self) -> bool {
        !matches!(self, ApplyResult::Failed { .. })
    }

    /// Map a platform completion code to a result.
    pub fn from_error_code(code: i32) -> Self {
        match code {
            error_code::SUCCESS => ApplyResult::Succeeded,
            error_code::UPDATED_BUT_NOT_ACTIVE => ApplyResult::NeedsReboot,
            other => ApplyResult::Failed { code: other },
        }
    }
}

/// Events the engine emits while an apply is in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// Overall apply progress in `0.0..=1.0`, non-decreasing.
    Progress(f32),
    /// Terminal result. Nothing follows it.
    Finished(ApplyResult),
}

/// Engine status as seen by a fresh query (e.g. after a restart).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineStatus {
    Idle,
    Applying { progress: f32 },
    Suspended { progress: f32 },
    Finished(ApplyResult),
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The apply reached a terminal state before the cancel took effect.
    AlreadyFinished(ApplyResult),
    NotRunning,
}

/// What needs to happen before `apply` can be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    Ready,
    /// The device is rebooting into the apply mode; the process will
    /// not survive this.
    RebootScheduled,
}

/// Result of `finalize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalization {
    /// Slot that will boot next (A/B only).
    pub target_slot: Option<Slot>,
    /// Whether the device is about to reboot (or must be rebooted).
    pub reboot_required: bool,
    /// Boot the device was in when the build was staged, if the platform
    /// exposes a boot identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
}

/// What the running boot says about a staged build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootCheck {
    /// The staged build is running and has been marked good.
    Confirmed,
    /// The device has not rebooted since the build was staged.
    Pending,
    /// The device rebooted but is not running the staged build.
    RolledBack,
}

/// A/B system slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// Get the other slot.
    pub fn other(&self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Boot slot index used by the boot control tool.
    pub fn index(&self) -> u32 {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
        }
    }

    /// Parse a slot suffix such as `_a` or `b`.
    pub fn from_suffix(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('_') {
            "a" | "A" => Some(Slot::A),
            "b" | "B" => Some(Slot::B),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Raw callbacks from the A/B mechanism, before translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawCallback {
    /// Stage-local progress for the given platform status code.
    StatusUpdate { status: i32, progress: f32 },
    PayloadApplicationComplete { error_code: i32 },
}

/// Snapshot returned when querying the A/B mechanism directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MechanismStatus {
    pub status: i32,
    pub progress: f32,
    /// Completion code of the last finished apply, when known.
    pub last_error: Option<i32>,
}

impl MechanismStatus {
    pub fn idle() -> Self {
        Self {
            status: status_code::IDLE,
            progress: 0.0,
            last_error: None,
        }
    }
}

/// Result marker left behind by an A-only install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMarker {
    pub payload: Option<std::path::PathBuf>,
    pub error_code: i32,
}

impl ResultMarker {
    pub fn succeeded(&self) -> bool {
        self.error_code == error_code::SUCCESS
    }
}

/// Combine a stage-local progress value into overall apply progress.
///
/// Writing the new slot dominates the run time, so it takes the first 80%.
pub fn overall_progress(status: i32, stage_progress: f32) -> Option<f32> {
    let p = stage_progress.clamp(0.0, 1.0);
    match status {
        status_code::DOWNLOADING => Some(p * 0.8),
        status_code::VERIFYING => Some(0.8 + p * 0.1),
        status_code::FINALIZING => Some(0.9 + p * 0.1),
        status_code::UPDATED_NEED_REBOOT => Some(1.0),
        _ => None,
    }
}
