//! Mock platform collaborators for testing and development.
//!
//! Every call is recorded so tests can assert on what the engines asked the
//! platform to do. Callbacks are driven explicitly through
//! [`MockMechanism::emit`] or scripted to fire on submit.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::error::{EngineError, Result};
use crate::traits::{ApplyMechanism, BootControl, RecoveryControl};
use crate::types::{
    error_code, status_code, ApplyMode, MechanismStatus, RawCallback, ResultMarker, Slot,
};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scriptable A/B apply mechanism.
#[derive(Default)]
pub struct MockMechanism {
    callbacks: Mutex<Option<mpsc::UnboundedSender<RawCallback>>>,
    status: Mutex<Option<MechanismStatus>>,
    script: Mutex<Vec<RawCallback>>,
    submitted: Mutex<Vec<(PathBuf, ApplyMode)>>,
    fail_submit: Mutex<Option<String>>,
    cancel_calls: AtomicUsize,
    query_calls: AtomicUsize,
    suspend_calls: AtomicUsize,
    resume_calls: AtomicUsize,
}

impl MockMechanism {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks replayed, in order, right after every submit or bind.
    pub fn with_script(self, script: Vec<RawCallback>) -> Self {
        *guard(&self.script) = script;
        self
    }

    /// A script that runs an apply through to success.
    pub fn succeeding() -> Self {
        Self::new().with_script(vec![
            RawCallback::StatusUpdate {
                status: status_code::DOWNLOADING,
                progress: 0.5,
            },
            RawCallback::StatusUpdate {
                status: status_code::FINALIZING,
                progress: 1.0,
            },
            RawCallback::PayloadApplicationComplete {
                error_code: error_code::SUCCESS,
            },
        ])
    }

    pub fn fail_submit(&self, reason: &str) {
        *guard(&self.fail_submit) = Some(reason.to_string());
    }

    /// Override what `query` returns.
    pub fn set_query(&self, status: MechanismStatus) {
        *guard(&self.status) = Some(status);
    }

    /// Deliver a raw callback to the bound subscriber, if any.
    pub fn emit(&self, callback: RawCallback) {
        self.track(callback);
        if let Some(tx) = guard(&self.callbacks).as_ref() {
            let _ = tx.send(callback);
        }
    }

    fn track(&self, callback: RawCallback) {
        let next = match callback {
            RawCallback::StatusUpdate { status, progress } => MechanismStatus {
                status,
                progress,
                last_error: None,
            },
            RawCallback::PayloadApplicationComplete { error_code } => {
                if error_code == error_code::SUCCESS {
                    MechanismStatus {
                        status: status_code::UPDATED_NEED_REBOOT,
                        progress: 1.0,
                        last_error: Some(error_code),
                    }
                } else {
                    MechanismStatus {
                        status: status_code::IDLE,
                        progress: 0.0,
                        last_error: Some(error_code),
                    }
                }
            }
        };
        *guard(&self.status) = Some(next);
    }

    fn replay_script(&self) {
        let script = guard(&self.script).clone();
        for callback in script {
            self.emit(callback);
        }
    }

    pub fn submitted(&self) -> Vec<(PathBuf, ApplyMode)> {
        guard(&self.submitted).clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn suspend_calls(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApplyMechanism for MockMechanism {
    #[instrument(skip(self, callbacks), fields(payload = %payload.display()))]
    async fn submit(
        &self,
        payload: &Path,
        mode: ApplyMode,
        callbacks: mpsc::UnboundedSender<RawCallback>,
    ) -> Result<()> {
        if let Some(reason) = guard(&self.fail_submit).clone() {
            return Err(EngineError::Unavailable(reason));
        }
        guard(&self.submitted).push((payload.to_path_buf(), mode));
        *guard(&self.callbacks) = Some(callbacks);
        *guard(&self.status) = Some(MechanismStatus {
            status: status_code::DOWNLOADING,
            progress: 0.0,
            last_error: None,
        });
        debug!("Mock apply submitted");
        self.replay_script();
        Ok(())
    }

    async fn bind(&self, callbacks: mpsc::UnboundedSender<RawCallback>) -> Result<()> {
        *guard(&self.callbacks) = Some(callbacks);
        self.replay_script();
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let current = guard(&self.status).unwrap_or_else(MechanismStatus::idle);
        if current.status == status_code::UPDATED_NEED_REBOOT {
            return Err(EngineError::Unavailable(
                "apply already completed".to_string(),
            ));
        }
        *guard(&self.status) = Some(MechanismStatus {
            status: status_code::IDLE,
            progress: 0.0,
            last_error: Some(error_code::USER_CANCELED),
        });
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self) -> Result<MechanismStatus> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Ok(guard(&self.status).unwrap_or_else(MechanismStatus::idle))
    }
}

#[derive(Debug)]
struct BootState {
    booted: Slot,
    active: Slot,
    marked_successful: bool,
    boots: u32,
}

/// In-memory bootloader slot control.
pub struct MockBootControl {
    state: Mutex<BootState>,
}

impl MockBootControl {
    pub fn new(booted: Slot) -> Self {
        Self {
            state: Mutex::new(BootState {
                booted,
                active: booted,
                marked_successful: false,
                boots: 0,
            }),
        }
    }

    /// Boot into whichever slot is currently active.
    pub fn simulate_reboot(&self) {
        let mut st = guard(&self.state);
        st.booted = st.active;
        st.marked_successful = false;
        st.boots += 1;
    }

    pub fn active_slot(&self) -> Slot {
        guard(&self.state).active
    }

    pub fn marked_successful(&self) -> bool {
        guard(&self.state).marked_successful
    }
}

#[async_trait]
impl BootControl for MockBootControl {
    async fn current_slot(&self) -> Result<Slot> {
        Ok(guard(&self.state).booted)
    }

    async fn set_active_boot_slot(&self, slot: Slot) -> Result<()> {
        guard(&self.state).active = slot;
        Ok(())
    }

    async fn mark_boot_successful(&self) -> Result<()> {
        guard(&self.state).marked_successful = true;
        Ok(())
    }

    async fn boot_id(&self) -> Result<String> {
        Ok(format!("mock-boot-{}", guard(&self.state).boots))
    }
}

#[derive(Debug, Default)]
struct RecoveryState {
    in_apply_mode: bool,
    pending_mode: Option<bool>,
    staged: Option<PathBuf>,
    marker: Option<ResultMarker>,
    install_code: i32,
    install_delay: Duration,
    installs: usize,
}

/// In-memory special boot mode control.
#[derive(Default)]
pub struct MockRecovery {
    state: Mutex<RecoveryState>,
}

impl MockRecovery {
    pub fn new(in_apply_mode: bool) -> Self {
        Self {
            state: Mutex::new(RecoveryState {
                in_apply_mode,
                ..RecoveryState::default()
            }),
        }
    }

    /// Completion code the next install leaves in the marker.
    pub fn set_install_code(&self, code: i32) {
        guard(&self.state).install_code = code;
    }

    pub fn set_install_delay(&self, delay: Duration) {
        guard(&self.state).install_delay = delay;
    }

    pub fn set_marker(&self, marker: Option<ResultMarker>) {
        guard(&self.state).marker = marker;
    }

    /// Apply any boot mode change requested before the "reboot".
    pub fn simulate_reboot(&self) {
        let mut st = guard(&self.state);
        if let Some(mode) = st.pending_mode.take() {
            st.in_apply_mode = mode;
        }
    }

    pub fn staged_payload(&self) -> Option<PathBuf> {
        guard(&self.state).staged.clone()
    }

    pub fn installs(&self) -> usize {
        guard(&self.state).installs
    }

    pub fn reboot_pending(&self) -> Option<bool> {
        guard(&self.state).pending_mode
    }
}

#[async_trait]
impl RecoveryControl for MockRecovery {
    async fn in_apply_mode(&self) -> Result<bool> {
        Ok(guard(&self.state).in_apply_mode)
    }

    async fn reboot_into_apply_mode(&self, payload: &Path) -> Result<()> {
        let mut st = guard(&self.state);
        st.staged = Some(payload.to_path_buf());
        st.pending_mode = Some(true);
        Ok(())
    }

    async fn install(&self, payload: &Path) -> Result<()> {
        let delay = guard(&self.state).install_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut st = guard(&self.state);
        st.installs += 1;
        st.marker = Some(ResultMarker {
            payload: Some(payload.to_path_buf()),
            error_code: st.install_code,
        });
        Ok(())
    }

    async fn read_result_marker(&self) -> Result<Option<ResultMarker>> {
        Ok(guard(&self.state).marker.clone())
    }

    async fn clear_result_marker(&self) -> Result<()> {
        guard(&self.state).marker = None;
        Ok(())
    }

    async fn reboot_to_normal(&self) -> Result<()> {
        let mut st = guard(&self.state);
        if st.in_apply_mode {
            st.pending_mode = Some(false);
        }
        Ok(())
    }
}
