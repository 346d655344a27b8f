//! User-facing update status.
//!
//! The orchestrator publishes [`StatusEvent`]s; this is the only contract
//! towards a UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    Network,
    Parse,
    IntegrityMismatch,
    Disk,
    SizeMismatch,
    PlatformApply { code: i32 },
    /// The device rebooted but came back on the previous build.
    RolledBack,
    Engine,
    Cancelled,
    Internal,
}

/// Why a session is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// The battery gate denied starting or continuing. Clears by itself.
    PowerGateDenied,
    /// The user asked for a pause. Only an explicit resume clears it.
    UserRequested,
}

/// Download progress in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_received: u64,
    pub total_bytes: u64,
}

impl DownloadProgress {
    pub fn new(bytes_received: u64, total_bytes: u64) -> Self {
        Self {
            bytes_received,
            total_bytes,
        }
    }

    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_received as f64 / self.total_bytes as f64) as f32
        }
    }

    /// Progress in tenths of a percent, used to throttle status updates.
    pub fn permille(&self) -> u32 {
        if self.total_bytes == 0 {
            0
        } else {
            ((self.bytes_received as u128 * 1000) / self.total_bytes as u128) as u32
        }
    }
}

/// Status published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Nothing has happened yet in this process.
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable { version: String },
    Downloading { progress: DownloadProgress },
    Verifying,
    Paused { reason: PauseReason },
    Applying { progress: f32 },
    AppliedPendingReboot,
    Failed { reason: FailureReason },
    Applied,
}

impl UpdateStatus {
    /// Phase order of the status within one session. `Paused` has no rank
    /// of its own since it can interrupt several phases.
    pub fn rank(&self) -> Option<u8> {
        match self {
            UpdateStatus::Idle => Some(0),
            UpdateStatus::Checking => Some(1),
            UpdateStatus::NoUpdate | UpdateStatus::UpdateAvailable { .. } => Some(2),
            UpdateStatus::Downloading { .. } => Some(3),
            UpdateStatus::Verifying => Some(4),
            UpdateStatus::Applying { .. } => Some(5),
            UpdateStatus::AppliedPendingReboot => Some(6),
            UpdateStatus::Applied => Some(7),
            UpdateStatus::Failed { .. } => Some(8),
            UpdateStatus::Paused { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateStatus::NoUpdate | UpdateStatus::Failed { .. } | UpdateStatus::Applied
        )
    }
}

/// One published status, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session: Uuid,
    /// Monotonic per orchestrator.
    pub seq: u64,
    pub status: UpdateStatus,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn initial() -> Self {
        Self {
            session: Uuid::nil(),
            seq: 0,
            status: UpdateStatus::Idle,
            at: Utc::now(),
        }
    }
}

/// Drops events from superseded sessions and phase regressions.
///
/// Events of a session other than the newest one seen are discarded, as are
/// events whose phase rank is lower than the last accepted one.
#[derive(Debug, Default)]
pub struct StatusFilter {
    session: Option<Uuid>,
    last_seq: u64,
    last_rank: u8,
}

impl StatusFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, event: &StatusEvent) -> bool {
        if event.seq <= self.last_seq && self.session.is_some() {
            return false;
        }
        if self.session != Some(event.session) {
            // Sequence numbers are global, so a newer seq means a newer session.
            self.session = Some(event.session);
            self.last_rank = 0;
        }
        if let Some(rank) = event.status.rank() {
            if rank < self.last_rank {
                return false;
            }
            self.last_rank = rank;
        }
        self.last_seq = event.seq;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session: Uuid, seq: u64, status: UpdateStatus) -> StatusEvent {
        StatusEvent {
            session,
            seq,
            status,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_progress_math() {
        let p = DownloadProgress::new(400, 1000);
        assert_eq!(p.permille(), 400);
        assert!((p.fraction() - 0.4).abs() < 1e-6);
        assert_eq!(DownloadProgress::new(0, 0).permille(), 0);
    }

    #[test]
    fn test_filter_drops_stale_sessions_and_regressions() {
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let mut filter = StatusFilter::new();

        assert!(filter.accept(&event(old, 1, UpdateStatus::Checking)));
        assert!(filter.accept(&event(
            old,
            2,
            UpdateStatus::UpdateAvailable {
                version: "14".into()
            }
        )));
        assert!(filter.accept(&event(new, 3, UpdateStatus::Checking)));
        // Late event from the superseded session.
        assert!(!filter.accept(&event(old, 2, UpdateStatus::Verifying)));

        assert!(filter.accept(&event(
            new,
            4,
            UpdateStatus::Downloading {
                progress: DownloadProgress::new(1, 10)
            }
        )));
        assert!(filter.accept(&event(
            new,
            5,
            UpdateStatus::Paused {
                reason: PauseReason::PowerGateDenied
            }
        )));
        assert!(filter.accept(&event(
            new,
            6,
            UpdateStatus::Downloading {
                progress: DownloadProgress::new(2, 10)
            }
        )));
        assert!(filter.accept(&event(new, 7, UpdateStatus::Verifying)));
        assert!(!filter.accept(&event(new, 8, UpdateStatus::Checking)));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&UpdateStatus::Failed {
            reason: FailureReason::PlatformApply { code: 10 },
        })
        .unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"code\":10"));
    }
}
