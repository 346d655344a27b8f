//! Engine trait and the platform collaborators it is built on.
//!
//! The orchestrator only ever talks to [`UpdateEngine`]. The two variants
//! ([`crate::AbEngine`], [`crate::AOnlyEngine`]) are composed from the
//! lower-level collaborator traits, each of which has a command/file backed
//! implementation and a mock.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{
    ApplyMode, BootCheck, CancelOutcome, EngineEvent, EngineKind, EngineStatus, Finalization,
    MechanismStatus, Preparation, RawCallback, ResultMarker, Slot,
};

/// Uniform interface over the supported apply flows.
#[async_trait]
pub trait UpdateEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Make the device ready for `apply`.
    ///
    /// A/B engines are always ready. A-only engines schedule a reboot into
    /// the apply mode when not already there.
    async fn prepare(&self, payload: &Path) -> Result<Preparation>;

    /// Start applying a verified payload. Returns once the apply has been
    /// submitted; progress and the terminal result arrive on `events`.
    async fn apply(&self, payload: &Path, events: mpsc::UnboundedSender<EngineEvent>)
        -> Result<()>;

    /// Re-subscribe to an apply that was started by an earlier process.
    async fn attach(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<()>;

    /// Request cancellation of the running apply.
    async fn cancel(&self) -> Result<CancelOutcome>;

    /// Pause the running apply.
    async fn suspend(&self) -> Result<()>;

    /// Continue a paused apply.
    async fn resume(&self) -> Result<()>;

    /// Query the current engine status.
    async fn status(&self) -> Result<EngineStatus>;

    /// Make the applied build bootable.
    async fn finalize(&self) -> Result<Finalization>;

    /// Compare the running boot against what `finalize` staged. Marks the
    /// boot good when the staged build is the one running.
    async fn confirm_boot(&self, staged: &Finalization) -> Result<BootCheck>;

    /// Undo `finalize` so the next boot stays on the running build.
    async fn discard_staged(&self, staged: &Finalization) -> Result<()>;
}

/// Platform mechanism that writes the payload into the inactive slot.
#[async_trait]
pub trait ApplyMechanism: Send + Sync {
    /// Submit a payload. Raw callbacks are sent on `callbacks` until the
    /// completion callback.
    async fn submit(
        &self,
        payload: &Path,
        mode: ApplyMode,
        callbacks: mpsc::UnboundedSender<RawCallback>,
    ) -> Result<()>;

    /// Subscribe to callbacks of whatever is currently running.
    async fn bind(&self, callbacks: mpsc::UnboundedSender<RawCallback>) -> Result<()>;

    async fn cancel(&self) -> Result<()>;

    async fn suspend(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn query(&self) -> Result<MechanismStatus>;
}

/// Bootloader slot control for A/B devices.
#[async_trait]
pub trait BootControl: Send + Sync {
    async fn current_slot(&self) -> Result<Slot>;

    async fn set_active_boot_slot(&self, slot: Slot) -> Result<()>;

    async fn mark_boot_successful(&self) -> Result<()>;

    /// Identity of the running boot. Changes on every reboot.
    async fn boot_id(&self) -> Result<String>;
}

/// Special boot mode control for A-only devices.
#[async_trait]
pub trait RecoveryControl: Send + Sync {
    /// Whether the device is currently booted into the apply mode.
    async fn in_apply_mode(&self) -> Result<bool>;

    /// Stage the payload and reboot into the apply mode.
    async fn reboot_into_apply_mode(&self, payload: &Path) -> Result<()>;

    /// Install the payload. Blocks until the install finishes and leaves a
    /// result marker behind.
    async fn install(&self, payload: &Path) -> Result<()>;

    async fn read_result_marker(&self) -> Result<Option<ResultMarker>>;

    async fn clear_result_marker(&self) -> Result<()>;

    /// Leave the apply mode. No-op when already booted normally.
    async fn reboot_to_normal(&self) -> Result<()>;
}
