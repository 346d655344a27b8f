//! A/B engine: applies to the inactive slot while the system keeps running.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::traits::{ApplyMechanism, BootControl, UpdateEngine};
use crate::types::{
    error_code, overall_progress, status_code, ApplyMode, ApplyResult, BootCheck,
    CancelOutcome, EngineEvent, EngineKind, EngineStatus, Finalization, MechanismStatus,
    Preparation, RawCallback,
};

#[derive(Debug, Default)]
struct AbState {
    running: bool,
    suspended: bool,
    progress: f32,
    terminal: Option<ApplyResult>,
}

fn lock(state: &Mutex<AbState>) -> MutexGuard<'_, AbState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A/B engine built on an [`ApplyMechanism`] and a [`BootControl`].
pub struct AbEngine {
    mechanism: Arc<dyn ApplyMechanism>,
    boot: Arc<dyn BootControl>,
    mode: ApplyMode,
    state: Arc<Mutex<AbState>>,
}

impl AbEngine {
    pub fn new(mechanism: Arc<dyn ApplyMechanism>, boot: Arc<dyn BootControl>) -> Self {
        Self {
            mechanism,
            boot,
            mode: ApplyMode::default(),
            state: Arc::new(Mutex::new(AbState::default())),
        }
    }

    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Forward translated callbacks until the terminal one.
    fn spawn_pump(
        &self,
        mut raw: mpsc::UnboundedReceiver<RawCallback>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(callback) = raw.recv().await {
                let event = {
                    let mut st = lock(&state);
                    match translate(&mut st, callback) {
                        Some(event) => event,
                        None => continue,
                    }
                };
                let terminal = matches!(event, EngineEvent::Finished(_));
                if events.send(event).is_err() {
                    debug!("Engine event receiver dropped");
                }
                if terminal {
                    break;
                }
            }
        });
    }
}

/// Translate one raw callback, updating `st`. Returns `None` for callbacks
/// that must not surface: anything after a terminal result, progress going
/// backwards, and statuses that carry no progress.
fn translate(st: &mut AbState, callback: RawCallback) -> Option<EngineEvent> {
    if st.terminal.is_some() {
        debug!(?callback, "Dropping callback after terminal result");
        return None;
    }

    match callback {
        RawCallback::StatusUpdate { status, progress } => {
            if status == status_code::UPDATED_NEED_REBOOT {
                return Some(finish(st, ApplyResult::NeedsReboot));
            }
            if status == status_code::REPORTING_ERROR_EVENT {
                // The completion callback carries the actual code.
                return None;
            }
            let overall = overall_progress(status, progress)?;
            if overall < st.progress {
                return None;
            }
            st.progress = overall;
            Some(EngineEvent::Progress(overall))
        }
        RawCallback::PayloadApplicationComplete { error_code } => {
            Some(finish(st, ApplyResult::from_error_code(error_code)))
        }
    }
}

fn finish(st: &mut AbState, result: ApplyResult) -> EngineEvent {
    st.running = false;
    st.suspended = false;
    st.terminal = Some(result);
    if result.is_success() {
        st.progress = 1.0;
    }
    EngineEvent::Finished(result)
}

/// Map a fresh mechanism query to an engine status.
fn status_from_query(query: MechanismStatus) -> EngineStatus {
    match query.status {
        status_code::IDLE => match query.last_error {
            Some(code) if code != error_code::SUCCESS => {
                EngineStatus::Finished(ApplyResult::from_error_code(code))
            }
            _ => EngineStatus::Idle,
        },
        status_code::DOWNLOADING | status_code::VERIFYING | status_code::FINALIZING => {
            EngineStatus::Applying {
                progress: overall_progress(query.status, query.progress).unwrap_or(0.0),
            }
        }
        status_code::UPDATED_NEED_REBOOT | status_code::UPDATED_BUT_NOT_ACTIVE => {
            EngineStatus::Finished(ApplyResult::NeedsReboot)
        }
        status_code::REPORTING_ERROR_EVENT => EngineStatus::Finished(ApplyResult::Failed {
            code: query.last_error.unwrap_or(error_code::ERROR),
        }),
        other => {
            warn!(status = other, "Unexpected mechanism status, treating as idle");
            EngineStatus::Idle
        }
    }
}

#[async_trait]
impl UpdateEngine for AbEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::AB
    }

    async fn prepare(&self, _payload: &Path) -> Result<Preparation> {
        Ok(Preparation::Ready)
    }

    #[instrument(skip(self, events), fields(payload = %payload.display()))]
    async fn apply(
        &self,
        payload: &Path,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        {
            let mut st = lock(&self.state);
            if st.running {
                return Err(EngineError::AlreadyApplying);
            }
            *st = AbState {
                running: true,
                ..AbState::default()
            };
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.mechanism.submit(payload, self.mode, raw_tx).await {
            lock(&self.state).running = false;
            return Err(e);
        }
        self.spawn_pump(raw_rx, events);

        info!(mode = ?self.mode, "A/B apply submitted");
        Ok(())
    }

    #[instrument(skip(self, events))]
    async fn attach(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<()> {
        {
            let mut st = lock(&self.state);
            if st.running {
                return Err(EngineError::AlreadyApplying);
            }
            *st = AbState {
                running: true,
                ..AbState::default()
            };
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.mechanism.bind(raw_tx).await {
            lock(&self.state).running = false;
            return Err(e);
        }
        self.spawn_pump(raw_rx, events);

        info!("Re-attached to running A/B apply");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel(&self) -> Result<CancelOutcome> {
        {
            let st = lock(&self.state);
            if let Some(result) = st.terminal {
                return Ok(CancelOutcome::AlreadyFinished(result));
            }
            if !st.running {
                return Ok(CancelOutcome::NotRunning);
            }
        }

        if let Err(e) = self.mechanism.cancel().await {
            // The mechanism refuses to cancel once it is done.
            let query = self.mechanism.query().await?;
            if let EngineStatus::Finished(result) = status_from_query(query) {
                let mut st = lock(&self.state);
                let result = st.terminal.unwrap_or(result);
                st.running = false;
                st.terminal = Some(result);
                return Ok(CancelOutcome::AlreadyFinished(result));
            }
            return Err(e);
        }

        let mut st = lock(&self.state);
        if let Some(result) = st.terminal {
            return Ok(CancelOutcome::AlreadyFinished(result));
        }
        st.running = false;
        st.terminal = Some(ApplyResult::Failed {
            code: error_code::USER_CANCELED,
        });
        info!("A/B apply cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    async fn suspend(&self) -> Result<()> {
        if !lock(&self.state).running {
            return Err(EngineError::PreconditionFailed(
                "no apply is running".to_string(),
            ));
        }
        self.mechanism.suspend().await?;
        lock(&self.state).suspended = true;
        info!("A/B apply suspended");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.mechanism.resume().await?;
        lock(&self.state).suspended = false;
        info!("A/B apply resumed");
        Ok(())
    }

    async fn status(&self) -> Result<EngineStatus> {
        {
            let st = lock(&self.state);
            if let Some(result) = st.terminal {
                return Ok(EngineStatus::Finished(result));
            }
            if st.running {
                return Ok(if st.suspended {
                    EngineStatus::Suspended {
                        progress: st.progress,
                    }
                } else {
                    EngineStatus::Applying {
                        progress: st.progress,
                    }
                });
            }
        }

        let query = self.mechanism.query().await?;
        debug!(status = query.status, progress = query.progress, "Mechanism queried");
        Ok(status_from_query(query))
    }

    #[instrument(skip(self))]
    async fn finalize(&self) -> Result<Finalization> {
        let current = self.boot.current_slot().await?;
        let boot_id = match self.boot.boot_id().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Boot id unavailable, rollback detection disabled");
                None
            }
        };
        let target = current.other();
        self.boot.set_active_boot_slot(target).await?;
        info!(from = %current, to = %target, "Switched active boot slot");
        Ok(Finalization {
            target_slot: Some(target),
            reboot_required: true,
            boot_id,
        })
    }

    #[instrument(skip(self))]
    async fn confirm_boot(&self, staged: &Finalization) -> Result<BootCheck> {
        let target = staged.target_slot.ok_or_else(|| {
            EngineError::PreconditionFailed(
                "A/B boot confirmation needs a target slot".to_string(),
            )
        })?;
        let current = self.boot.current_slot().await?;
        if current == target {
            self.boot.mark_boot_successful().await?;
            info!(slot = %current, "Boot confirmed on target slot");
            return Ok(BootCheck::Confirmed);
        }

        let booted = self.boot.boot_id().await.ok();
        match (&staged.boot_id, booted) {
            (Some(before), Some(now)) if *before != now => {
                warn!(expected = %target, actual = %current, "Rebooted into the old slot");
                Ok(BootCheck::RolledBack)
            }
            _ => {
                debug!(expected = %target, actual = %current, "Reboot still pending");
                Ok(BootCheck::Pending)
            }
        }
    }

    #[instrument(skip(self))]
    async fn discard_staged(&self, staged: &Finalization) -> Result<()> {
        let current = self.boot.current_slot().await?;
        if staged.target_slot == Some(current) {
            return Ok(());
        }
        self.boot.set_active_boot_slot(current).await?;
        info!(slot = %current, "Restored active boot slot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBootControl, MockMechanism};
    use crate::types::Slot;
    use std::path::PathBuf;

    fn engine(mechanism: Arc<MockMechanism>, boot: Arc<MockBootControl>) -> AbEngine {
        AbEngine::new(mechanism, boot)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("engine event channel closed")
    }

    #[tokio::test]
    async fn test_progress_then_success() {
        let mechanism = Arc::new(MockMechanism::new());
        let boot = Arc::new(MockBootControl::new(Slot::A));
        let engine = engine(mechanism.clone(), boot);

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.apply(&PathBuf::from("/data/payload.zip"), tx).await.unwrap();

        mechanism.emit(RawCallback::StatusUpdate {
            status: status_code::DOWNLOADING,
            progress: 0.5,
        });
        mechanism.emit(RawCallback::PayloadApplicationComplete { error_code: 0 });

        assert_eq!(next(&mut rx).await, EngineEvent::Progress(0.4));
        assert_eq!(
            next(&mut rx).await,
            EngineEvent::Finished(ApplyResult::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_callbacks_after_terminal_are_dropped() {
        let mechanism = Arc::new(MockMechanism::new());
        let engine = engine(mechanism.clone(), Arc::new(MockBootControl::new(Slot::A)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.apply(Path::new("/tmp/p"), tx).await.unwrap();

        mechanism.emit(RawCallback::PayloadApplicationComplete { error_code: 0 });
        mechanism.emit(RawCallback::StatusUpdate {
            status: status_code::DOWNLOADING,
            progress: 0.9,
        });
        mechanism.emit(RawCallback::PayloadApplicationComplete {
            error_code: error_code::ERROR,
        });

        assert_eq!(
            next(&mut rx).await,
            EngineEvent::Finished(ApplyResult::Succeeded)
        );
        // Pump stops after the terminal event, so the channel closes.
        let rest = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(rest, None);
    }

    #[tokio::test]
    async fn test_progress_never_goes_backwards() {
        let mut st = AbState {
            running: true,
            ..AbState::default()
        };
        let up = translate(
            &mut st,
            RawCallback::StatusUpdate {
                status: status_code::VERIFYING,
                progress: 0.5,
            },
        );
        match up {
            Some(EngineEvent::Progress(p)) => assert!((p - 0.85).abs() < 1e-6),
            other => panic!("unexpected event: {:?}", other),
        }
        let down = translate(
            &mut st,
            RawCallback::StatusUpdate {
                status: status_code::DOWNLOADING,
                progress: 0.1,
            },
        );
        assert_eq!(down, None);
    }

    #[tokio::test]
    async fn test_cancel_after_success_reports_already_finished() {
        let mechanism = Arc::new(MockMechanism::new());
        let engine = engine(mechanism.clone(), Arc::new(MockBootControl::new(Slot::A)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.apply(Path::new("/tmp/p"), tx).await.unwrap();
        mechanism.emit(RawCallback::PayloadApplicationComplete { error_code: 0 });
        next(&mut rx).await;

        let outcome = engine.cancel().await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyFinished(ApplyResult::Succeeded)
        );
        assert_eq!(mechanism.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_apply() {
        let mechanism = Arc::new(MockMechanism::new());
        let engine = engine(mechanism.clone(), Arc::new(MockBootControl::new(Slot::A)));

        assert_eq!(engine.cancel().await.unwrap(), CancelOutcome::NotRunning);

        let (tx, _rx) = mpsc::unbounded_channel();
        engine.apply(Path::new("/tmp/p"), tx).await.unwrap();
        assert_eq!(engine.cancel().await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(mechanism.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_status_queries_mechanism_when_not_tracking() {
        let mechanism = Arc::new(MockMechanism::new());
        mechanism.set_query(MechanismStatus {
            status: status_code::UPDATED_NEED_REBOOT,
            progress: 1.0,
            last_error: None,
        });
        let engine = engine(mechanism.clone(), Arc::new(MockBootControl::new(Slot::A)));

        let status = engine.status().await.unwrap();
        assert_eq!(status, EngineStatus::Finished(ApplyResult::NeedsReboot));
        assert_eq!(mechanism.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_finalize_and_confirm_boot() {
        let mechanism = Arc::new(MockMechanism::new());
        let boot = Arc::new(MockBootControl::new(Slot::A));
        let engine = engine(mechanism, boot.clone());

        let fin = engine.finalize().await.unwrap();
        assert_eq!(fin.target_slot, Some(Slot::B));
        assert!(fin.boot_id.is_some());
        assert_eq!(boot.active_slot(), Slot::B);

        // Still on A and no reboot yet.
        assert_eq!(engine.confirm_boot(&fin).await.unwrap(), BootCheck::Pending);

        boot.simulate_reboot();
        assert_eq!(engine.confirm_boot(&fin).await.unwrap(), BootCheck::Confirmed);
        assert!(boot.marked_successful());
    }

    #[tokio::test]
    async fn test_reboot_into_old_slot_is_rollback() {
        let boot = Arc::new(MockBootControl::new(Slot::A));
        let engine = engine(Arc::new(MockMechanism::new()), boot.clone());

        let fin = engine.finalize().await.unwrap();
        // Bootloader gave up on B.
        boot.set_active_boot_slot(Slot::A).await.unwrap();
        boot.simulate_reboot();

        assert_eq!(engine.confirm_boot(&fin).await.unwrap(), BootCheck::RolledBack);
        assert!(!boot.marked_successful());
    }

    #[tokio::test]
    async fn test_unknown_boot_id_keeps_waiting() {
        let boot = Arc::new(MockBootControl::new(Slot::A));
        let engine = engine(Arc::new(MockMechanism::new()), boot.clone());

        let mut fin = engine.finalize().await.unwrap();
        fin.boot_id = None;
        boot.set_active_boot_slot(Slot::A).await.unwrap();
        boot.simulate_reboot();

        assert_eq!(engine.confirm_boot(&fin).await.unwrap(), BootCheck::Pending);
    }

    #[tokio::test]
    async fn test_discard_staged_restores_active_slot() {
        let boot = Arc::new(MockBootControl::new(Slot::A));
        let engine = engine(Arc::new(MockMechanism::new()), boot.clone());

        let fin = engine.finalize().await.unwrap();
        assert_eq!(boot.active_slot(), Slot::B);
        engine.discard_staged(&fin).await.unwrap();
        assert_eq!(boot.active_slot(), Slot::A);
    }
}
