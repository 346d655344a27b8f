//! A-only engine: applies from a special boot mode on single-slot devices.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::traits::{RecoveryControl, UpdateEngine};
use crate::types::{
    error_code, ApplyResult, BootCheck, CancelOutcome, EngineEvent, EngineKind, EngineStatus,
    Finalization, Preparation, ResultMarker,
};

#[derive(Debug, Default)]
struct AOnlyState {
    installing: bool,
    terminal: Option<ApplyResult>,
}

fn lock(state: &Mutex<AOnlyState>) -> MutexGuard<'_, AOnlyState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Translate an install result marker. A successful install still needs a
/// reboot back into the normal mode.
fn result_from_marker(marker: &ResultMarker) -> ApplyResult {
    if marker.succeeded() {
        ApplyResult::NeedsReboot
    } else {
        ApplyResult::Failed {
            code: marker.error_code,
        }
    }
}

pub struct AOnlyEngine {
    recovery: Arc<dyn RecoveryControl>,
    state: Arc<Mutex<AOnlyState>>,
}

impl AOnlyEngine {
    pub fn new(recovery: Arc<dyn RecoveryControl>) -> Self {
        Self {
            recovery,
            state: Arc::new(Mutex::new(AOnlyState::default())),
        }
    }
}

#[async_trait]
impl UpdateEngine for AOnlyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::AOnly
    }

    #[instrument(skip(self), fields(payload = %payload.display()))]
    async fn prepare(&self, payload: &Path) -> Result<Preparation> {
        if self.recovery.in_apply_mode().await? {
            return Ok(Preparation::Ready);
        }
        self.recovery.reboot_into_apply_mode(payload).await?;
        info!("Rebooting into apply mode");
        Ok(Preparation::RebootScheduled)
    }

    #[instrument(skip(self, events), fields(payload = %payload.display()))]
    async fn apply(
        &self,
        payload: &Path,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        if !self.recovery.in_apply_mode().await? {
            return Err(EngineError::PreconditionFailed(
                "device is not booted into the apply mode".to_string(),
            ));
        }
        {
            let mut st = lock(&self.state);
            if st.installing {
                return Err(EngineError::AlreadyApplying);
            }
            *st = AOnlyState {
                installing: true,
                terminal: None,
            };
        }

        let recovery = self.recovery.clone();
        let state = self.state.clone();
        let payload: PathBuf = payload.to_path_buf();
        let _ = events.send(EngineEvent::Progress(0.0));

        tokio::spawn(async move {
            let result = match recovery.install(&payload).await {
                Ok(()) => match recovery.read_result_marker().await {
                    Ok(Some(marker)) => result_from_marker(&marker),
                    Ok(None) => {
                        warn!("Install finished without leaving a result marker");
                        ApplyResult::Failed {
                            code: error_code::ERROR,
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read install result marker");
                        ApplyResult::Failed {
                            code: error_code::ERROR,
                        }
                    }
                },
                Err(e) => {
                    error!(error = %e, "Install failed");
                    ApplyResult::Failed {
                        code: error_code::ERROR,
                    }
                }
            };

            {
                let mut st = lock(&state);
                st.installing = false;
                st.terminal = Some(result);
            }
            if result.is_success() {
                let _ = events.send(EngineEvent::Progress(1.0));
            }
            let _ = events.send(EngineEvent::Finished(result));
            info!(?result, "A-only install finished");
        });

        Ok(())
    }

    /// The result of an install started before a reboot is only visible
    /// through the marker, so replay it if present.
    async fn attach(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<()> {
        match self.recovery.read_result_marker().await? {
            Some(marker) => {
                let result = result_from_marker(&marker);
                lock(&self.state).terminal = Some(result);
                let _ = events.send(EngineEvent::Finished(result));
                Ok(())
            }
            None => Err(EngineError::PreconditionFailed(
                "no install result to attach to".to_string(),
            )),
        }
    }

    async fn cancel(&self) -> Result<CancelOutcome> {
        let st = lock(&self.state);
        if let Some(result) = st.terminal {
            return Ok(CancelOutcome::AlreadyFinished(result));
        }
        if st.installing {
            return Err(EngineError::Unsupported {
                engine: "a_only",
                operation: "cancel",
            });
        }
        Ok(CancelOutcome::NotRunning)
    }

    async fn suspend(&self) -> Result<()> {
        Err(EngineError::Unsupported {
            engine: "a_only",
            operation: "suspend",
        })
    }

    async fn resume(&self) -> Result<()> {
        Err(EngineError::Unsupported {
            engine: "a_only",
            operation: "resume",
        })
    }

    async fn status(&self) -> Result<EngineStatus> {
        {
            let st = lock(&self.state);
            if let Some(result) = st.terminal {
                return Ok(EngineStatus::Finished(result));
            }
            if st.installing {
                return Ok(EngineStatus::Applying { progress: 0.0 });
            }
        }
        Ok(match self.recovery.read_result_marker().await? {
            Some(marker) => EngineStatus::Finished(result_from_marker(&marker)),
            None => EngineStatus::Idle,
        })
    }

    #[instrument(skip(self))]
    async fn finalize(&self) -> Result<Finalization> {
        let reboot_required = self.recovery.in_apply_mode().await?;
        self.recovery.reboot_to_normal().await?;
        Ok(Finalization {
            target_slot: None,
            reboot_required,
            boot_id: None,
        })
    }

    #[instrument(skip(self))]
    async fn confirm_boot(&self, staged: &Finalization) -> Result<BootCheck> {
        if self.recovery.in_apply_mode().await? {
            return Ok(BootCheck::Pending);
        }
        match self.recovery.read_result_marker().await? {
            Some(marker) if marker.succeeded() => {
                self.recovery.clear_result_marker().await?;
                info!("Boot into applied build confirmed");
                Ok(BootCheck::Confirmed)
            }
            Some(marker) => {
                warn!(code = marker.error_code, "Install marker reports failure");
                Ok(BootCheck::RolledBack)
            }
            // Staged from the apply mode and now booted normally.
            None if staged.reboot_required => {
                warn!("No install marker found after reboot");
                Ok(BootCheck::RolledBack)
            }
            None => Ok(BootCheck::Pending),
        }
    }

    async fn discard_staged(&self, _staged: &Finalization) -> Result<()> {
        // The install already ran; the next boot is a normal one either way.
        Ok(())
    }
}
