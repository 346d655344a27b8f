//! # Update Orchestrator
//!
//! Single owner of the update session. Every phase transition happens on
//! one task that consumes three kinds of input:
//!
//! ```text
//!   OrchestratorHandle ──commands──┐
//!                                  ▼
//!   download / verify / ──events──► run loop ──StatusEvent──► observers
//!   check / engine tasks           ▲
//!                                  │
//!   PowerGate ──────watch──────────┘
//! ```
//!
//! Background work (manifest checks, payload transfer, hashing, the engine's
//! callback pump) runs in spawned tasks that only enqueue events. Each event
//! carries the id of the task that produced it; events from a task the
//! session no longer waits on are dropped.
//!
//! The resume journal is written before each phase is entered, so a new
//! process can rebuild the session from disk on startup.

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use skyward_common::TimedOperation;
use skyward_engine::{
    ApplyResult, BootCheck, CancelOutcome, EngineEvent, EngineStatus, Preparation, UpdateEngine,
};
use skyward_power::PowerGate;

use super::device::read_installed_build;
use super::downloader::{DownloadEngine, DownloadState, DownloadStatus};
use super::error::{DownloadError, Result, UpdateError};
use super::manifest::{is_newer, BuildDescriptor, ManifestEntry, ManifestSource};
use super::resume::{ResumeJournal, ResumeRecord, SessionPhase};
use super::status::{DownloadProgress, FailureReason, PauseReason, StatusEvent, UpdateStatus};
use super::store::BuildStore;
use super::verifier::verify_or_discard;

const COMMAND_BUFFER: usize = 32;
const STATUS_BUFFER: usize = 256;

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub manifest: Arc<dyn ManifestSource>,
    pub engine: Arc<dyn UpdateEngine>,
    pub gate: Arc<PowerGate>,
    pub store: Arc<dyn BuildStore>,
    pub downloader: Arc<DownloadEngine>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub download_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Fallback baseline when no build has been applied yet.
    pub build_prop: PathBuf,
    pub auto_download: bool,
    pub auto_apply: bool,
    /// Journal the download offset every this many bytes.
    pub persist_every_bytes: u64,
}

/// Where a paused session goes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PausedFrom {
    Downloading,
    ReadyToApply,
    Applying,
}

/// Session phase as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    ReadyToApply,
    Applying,
    Finalizing,
    Paused {
        from: PausedFrom,
        reason: PauseReason,
        /// The paused work never started, so resuming needs the start gate.
        needs_start: bool,
    },
    Applied,
    Failed {
        reason: FailureReason,
    },
}

impl Phase {
    /// Phases that hold the session slot.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Phase::Idle
                | Phase::NoUpdate
                | Phase::UpdateAvailable
                | Phase::Applied
                | Phase::Failed { .. }
        )
    }
}

/// Result of a check request.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    UpdateAvailable(BuildDescriptor),
    NoUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session: Option<Uuid>,
    pub phase: Phase,
    pub build: Option<BuildDescriptor>,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub payload_path: Option<PathBuf>,
}

enum Command {
    Check(oneshot::Sender<Result<CheckOutcome>>),
    StartDownload(oneshot::Sender<Result<()>>),
    Apply(oneshot::Sender<Result<()>>),
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    Cancel(oneshot::Sender<Result<CancelOutcome>>),
    Snapshot(oneshot::Sender<Result<SessionSnapshot>>),
}

struct CheckResult {
    entry: ManifestEntry,
    newer: bool,
}

enum Internal {
    CheckDone {
        task: u64,
        result: Result<CheckResult>,
    },
    DownloadProgress {
        task: u64,
        progress: DownloadProgress,
    },
    DownloadDone {
        task: u64,
        result: std::result::Result<DownloadState, DownloadError>,
    },
    VerifyDone {
        task: u64,
        result: Result<()>,
    },
    Engine {
        task: u64,
        event: EngineEvent,
    },
}

impl Internal {
    fn task(&self) -> u64 {
        match self {
            Internal::CheckDone { task, .. }
            | Internal::DownloadProgress { task, .. }
            | Internal::DownloadDone { task, .. }
            | Internal::VerifyDone { task, .. }
            | Internal::Engine { task, .. } => *task,
        }
    }
}

struct Session {
    id: Uuid,
    phase: Phase,
    /// Background task whose events are currently awaited.
    task: u64,
    entry: Option<ManifestEntry>,
    record: Option<ResumeRecord>,
    pending_check: Option<oneshot::Sender<Result<CheckOutcome>>>,
    last_permille: Option<u32>,
    last_persisted: u64,
    apply_percent: Option<u32>,
    /// Restart the download once the cancelled transfer has stopped.
    relaunch: bool,
}

impl Session {
    fn new(id: Uuid, phase: Phase) -> Self {
        Self {
            id,
            phase,
            task: 0,
            entry: None,
            record: None,
            pending_check: None,
            last_permille: None,
            last_persisted: 0,
            apply_percent: None,
            relaunch: false,
        }
    }

    fn from_record(record: ResumeRecord, phase: Phase) -> Self {
        let mut session = Self::new(record.session, phase);
        session.last_persisted = record.bytes_received;
        session.record = Some(record);
        session
    }
}

/// The one place a session can live.
#[derive(Default)]
struct SessionSlot(Option<Session>);

impl SessionSlot {
    /// Install a new session unless an active one holds the slot.
    fn occupy(&mut self, session: Session) -> Result<&mut Session> {
        if self.0.as_ref().map_or(false, |s| s.phase.is_active()) {
            return Err(UpdateError::Busy);
        }
        Ok(self.0.insert(session))
    }

    fn get(&self) -> Option<&Session> {
        self.0.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut Session> {
        self.0.as_mut()
    }

    fn phase(&self) -> Phase {
        self.0.as_ref().map_or(Phase::Idle, |s| s.phase)
    }
}

fn payload_path(download_dir: &Path, build: &BuildDescriptor) -> PathBuf {
    let prefix = build.sha_512.get(..16).unwrap_or(&build.sha_512);
    download_dir.join(format!("{}-{}", prefix.to_ascii_lowercase(), build.file_name))
}

async fn remove_payload(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed payload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove payload"),
    }
}

async fn check_for_update(
    manifest: Arc<dyn ManifestSource>,
    store: Arc<dyn BuildStore>,
    build_prop: PathBuf,
) -> Result<CheckResult> {
    let entry = manifest.fetch_latest().await?;

    let baseline = match store.last_applied_build().await? {
        Some(build) => Some(build),
        None => read_installed_build(&build_prop).await,
    };
    let newer = match &baseline {
        Some(old) => is_newer(&entry.build, old),
        None => true,
    };
    debug!(
        candidate = entry.build.date,
        baseline = baseline.as_ref().map(|b| b.date),
        newer,
        "Compared builds"
    );

    store.set_last_checked_time(Utc::now()).await?;
    if let Some(changelog) = &entry.build.changelog {
        store.add_changelog(entry.build.date, changelog).await?;
    }

    Ok(CheckResult { entry, newer })
}

/// Cloneable front end of a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    status: broadcast::Sender<StatusEvent>,
    current: watch::Receiver<StatusEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| UpdateError::Shutdown)?;
        rx.await.map_err(|_| UpdateError::Shutdown)?
    }

    /// Check for a newer build. Rejected with `Busy` while a session is
    /// active.
    pub async fn check(&self) -> Result<CheckOutcome> {
        self.request(Command::Check).await
    }

    /// Download the available build.
    pub async fn start_download(&self) -> Result<()> {
        self.request(Command::StartDownload).await
    }

    /// Apply the verified payload, or apply it as soon as it is verified.
    pub async fn apply(&self) -> Result<()> {
        self.request(Command::Apply).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    /// Abandon the session.
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        self.request(Command::Cancel).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Every status event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Latest status event.
    pub fn current(&self) -> StatusEvent {
        self.current.borrow().clone()
    }

    /// Latest status event as a watch channel.
    pub fn watch(&self) -> watch::Receiver<StatusEvent> {
        self.current.clone()
    }
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    settings: OrchestratorSettings,
    journal: ResumeJournal,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Internal>,
    events_rx: mpsc::UnboundedReceiver<Internal>,
    status_tx: broadcast::Sender<StatusEvent>,
    current: watch::Sender<StatusEvent>,
    continue_rx: watch::Receiver<bool>,
    start_rx: watch::Receiver<bool>,
    slot: SessionSlot,
    seq: u64,
    next_task: u64,
}

impl Orchestrator {
    /// Start the orchestrator task. Persisted state is recovered before the
    /// first command is served.
    pub fn spawn(
        deps: OrchestratorDeps,
        settings: OrchestratorSettings,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(STATUS_BUFFER);
        let (current, current_rx) = watch::channel(StatusEvent::initial());

        let orchestrator = Orchestrator {
            journal: ResumeJournal::new(&settings.state_dir),
            continue_rx: deps.gate.subscribe(),
            start_rx: deps.gate.subscribe_start(),
            deps,
            settings,
            commands,
            events_tx,
            events_rx,
            status_tx: status_tx.clone(),
            current,
            slot: SessionSlot::default(),
            seq: 0,
            next_task: 0,
        };

        let handle = OrchestratorHandle {
            commands: commands_tx,
            status: status_tx,
            current: current_rx,
        };
        (handle, tokio::spawn(orchestrator.run()))
    }

    async fn run(mut self) {
        self.recover().await;
        info!("Update orchestrator running");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_internal(event).await,
                Ok(()) = self.continue_rx.changed() => self.on_gate_change().await,
                Ok(()) = self.start_rx.changed() => self.on_gate_change().await,
            }
        }

        info!("Update orchestrator stopped");
    }

    fn bump_task(&mut self) -> u64 {
        self.next_task += 1;
        self.next_task
    }

    fn emit(&mut self, status: UpdateStatus) {
        let Some(session) = self.slot.get() else {
            return;
        };
        self.seq += 1;
        let event = StatusEvent {
            session: session.id,
            seq: self.seq,
            status,
            at: Utc::now(),
        };
        debug!(session = %event.session, seq = event.seq, status = ?event.status, "Status");
        self.current.send_replace(event.clone());
        let _ = self.status_tx.send(event);
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(session) = self.slot.get_mut() {
            debug!(session = %session.id, from = ?session.phase, to = ?phase, "Phase change");
            session.phase = phase;
        }
    }

    fn record_mut(&mut self) -> Result<&mut ResumeRecord> {
        self.slot
            .get_mut()
            .and_then(|s| s.record.as_mut())
            .ok_or_else(|| UpdateError::InvalidState("no session record".to_string()))
    }

    /// Write the session record to the journal.
    async fn persist(&mut self) -> Result<()> {
        if let Some(record) = self.slot.get_mut().and_then(|s| s.record.as_mut()) {
            self.journal.save(record).await?;
        }
        Ok(())
    }

    async fn persist_phase(&mut self, phase: SessionPhase) -> Result<()> {
        self.record_mut()?.phase = phase;
        self.persist().await
    }

    /// Fail the session. The partial payload survives network failures so a
    /// later session for the same build can resume it.
    async fn fail(&mut self, err: &UpdateError) {
        let reason = err.reason();
        let task = self.bump_task();
        let Some(session) = self.slot.get_mut() else {
            return;
        };
        error!(session = %session.id, phase = ?session.phase, error = %err, "Update session failed");

        session.task = task;
        session.phase = Phase::Failed { reason };
        session.relaunch = false;
        let record = session.record.take();

        if let Some(record) = record {
            self.deps.downloader.cancel(&record.payload_path);
            if reason != FailureReason::Network {
                remove_payload(&record.payload_path).await;
            }
            if let Err(e) = self.journal.clear().await {
                warn!(error = %e, "Failed to clear session record");
            }
        }

        self.emit(UpdateStatus::Failed { reason });
    }

    /// Run a session step, failing the session when it errors. Returns the
    /// step's error for callers that reply to a command.
    async fn guard(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.fail(e).await;
        }
        result
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Check(reply) => self.on_check(reply),
            Command::StartDownload(reply) => {
                let result = self.on_start_download().await;
                let _ = reply.send(result);
            }
            Command::Apply(reply) => {
                let result = self.on_apply().await;
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = self.on_pause().await;
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.on_resume().await;
                let _ = reply.send(result);
            }
            Command::Cancel(reply) => {
                let result = self.on_cancel().await;
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.slot.get();
        let record = session.and_then(|s| s.record.as_ref());
        let build = record
            .map(|r| r.descriptor.clone())
            .or_else(|| session.and_then(|s| s.entry.as_ref()).map(|e| e.build.clone()));
        SessionSnapshot {
            session: session.map(|s| s.id),
            phase: self.slot.phase(),
            total_bytes: build.as_ref().map_or(0, |b| b.file_size),
            build,
            bytes_received: record.map_or(0, |r| r.bytes_received),
            payload_path: record.map(|r| r.payload_path.clone()),
        }
    }

    fn on_check(&mut self, reply: oneshot::Sender<Result<CheckOutcome>>) {
        let task = self.bump_task();
        let mut session = Session::new(Uuid::new_v4(), Phase::Checking);
        session.task = task;

        match self.slot.occupy(session) {
            Ok(session) => {
                info!(session = %session.id, "Checking for updates");
                session.pending_check = Some(reply);
            }
            Err(e) => {
                debug!("Check rejected, session busy");
                let _ = reply.send(Err(e));
                return;
            }
        }
        self.emit(UpdateStatus::Checking);

        let manifest = Arc::clone(&self.deps.manifest);
        let store = Arc::clone(&self.deps.store);
        let build_prop = self.settings.build_prop.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = check_for_update(manifest, store, build_prop).await;
            let _ = events.send(Internal::CheckDone { task, result });
        });
    }

    async fn on_start_download(&mut self) -> Result<()> {
        let phase = self.slot.phase();
        if phase != Phase::UpdateAvailable {
            return Err(UpdateError::InvalidState(format!(
                "cannot start a download while {:?}",
                phase
            )));
        }
        let result = self.begin_download().await;
        self.guard(result).await
    }

    async fn on_apply(&mut self) -> Result<()> {
        match self.slot.phase() {
            Phase::ReadyToApply => {
                let result = self.start_apply().await;
                self.guard(result).await
            }
            Phase::Paused {
                from: PausedFrom::ReadyToApply,
                ..
            } => {
                let result = self.resume_from_pause().await;
                self.guard(result).await
            }
            Phase::Downloading
            | Phase::Verifying
            | Phase::Paused {
                from: PausedFrom::Downloading,
                ..
            } => {
                info!("Apply requested, will apply once the payload is verified");
                self.record_mut()?.apply_requested = true;
                let result = self.persist().await;
                self.guard(result).await
            }
            phase => Err(UpdateError::InvalidState(format!(
                "nothing to apply while {:?}",
                phase
            ))),
        }
    }

    async fn on_pause(&mut self) -> Result<()> {
        match self.slot.phase() {
            Phase::Downloading => {
                let result = self.pause_download(PauseReason::UserRequested).await;
                self.guard(result).await
            }
            Phase::Applying => self.suspend_apply(PauseReason::UserRequested).await,
            Phase::Paused {
                from,
                reason: PauseReason::PowerGateDenied,
                needs_start,
            } => {
                self.set_phase(Phase::Paused {
                    from,
                    reason: PauseReason::UserRequested,
                    needs_start,
                });
                self.record_mut()?.paused = Some(PauseReason::UserRequested);
                let result = self.persist().await;
                self.guard(result).await?;
                self.emit(UpdateStatus::Paused {
                    reason: PauseReason::UserRequested,
                });
                Ok(())
            }
            Phase::Paused { .. } => Ok(()),
            phase => Err(UpdateError::InvalidState(format!(
                "nothing to pause while {:?}",
                phase
            ))),
        }
    }

    async fn on_resume(&mut self) -> Result<()> {
        match self.slot.phase() {
            Phase::Paused { .. } => {
                let result = self.resume_from_pause().await;
                self.guard(result).await
            }
            phase => Err(UpdateError::InvalidState(format!(
                "nothing to resume while {:?}",
                phase
            ))),
        }
    }

    async fn on_cancel(&mut self) -> Result<CancelOutcome> {
        let phase = self.slot.phase();
        match phase {
            Phase::Idle
            | Phase::NoUpdate
            | Phase::UpdateAvailable
            | Phase::Applied
            | Phase::Failed { .. } => Ok(CancelOutcome::NotRunning),
            Phase::Finalizing => self.cancel_staged().await,
            Phase::Checking => {
                let pending = self.slot.get_mut().and_then(|s| s.pending_check.take());
                self.fail(&UpdateError::Cancelled).await;
                if let Some(reply) = pending {
                    let _ = reply.send(Err(UpdateError::Cancelled));
                }
                Ok(CancelOutcome::Cancelled)
            }
            Phase::Applying
            | Phase::Paused {
                from: PausedFrom::Applying,
                ..
            } => self.cancel_apply().await,
            _ => {
                info!(phase = ?phase, "Cancelling update session");
                self.fail(&UpdateError::Cancelled).await;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn cancel_apply(&mut self) -> Result<CancelOutcome> {
        let outcome = self.deps.engine.cancel().await?;
        match outcome {
            CancelOutcome::AlreadyFinished(result) => {
                info!(result = ?result, "Apply finished before the cancel took effect");
                self.bump_task_for_session();
                let step = self.on_apply_finished(result).await;
                let _ = self.guard(step).await;
            }
            CancelOutcome::Cancelled | CancelOutcome::NotRunning => {
                self.fail(&UpdateError::Cancelled).await;
            }
        }
        Ok(match outcome {
            CancelOutcome::NotRunning => CancelOutcome::Cancelled,
            other => other,
        })
    }

    /// Drop a build that is staged but not yet booted. The boot target is
    /// restored first; if that fails the session stays staged.
    async fn cancel_staged(&mut self) -> Result<CancelOutcome> {
        if let Some(staged) = self.record_mut()?.finalization.clone() {
            self.deps.engine.discard_staged(&staged).await?;
        }
        info!("Discarding staged update");
        self.fail(&UpdateError::Cancelled).await;
        Ok(CancelOutcome::Cancelled)
    }

    /// Stop listening to the current background task.
    fn bump_task_for_session(&mut self) {
        let task = self.bump_task();
        if let Some(session) = self.slot.get_mut() {
            session.task = task;
        }
    }

    // -----------------------------------------------------------------------
    // Background events
    // -----------------------------------------------------------------------

    async fn handle_internal(&mut self, event: Internal) {
        let current = self.slot.get().map(|s| s.task);
        if current != Some(event.task()) {
            debug!(task = event.task(), current = ?current, "Dropping stale event");
            return;
        }

        let result = match event {
            Internal::CheckDone { result, .. } => {
                self.on_check_done(result).await;
                Ok(())
            }
            Internal::DownloadProgress { progress, .. } => self.on_download_progress(progress).await,
            Internal::DownloadDone { result, .. } => self.on_download_done(result).await,
            Internal::VerifyDone { result, .. } => self.on_verify_done(result).await,
            Internal::Engine { event, .. } => self.on_engine_event(event).await,
        };
        let _ = self.guard(result).await;
    }

    async fn on_check_done(&mut self, result: Result<CheckResult>) {
        let pending = self.slot.get_mut().and_then(|s| s.pending_check.take());

        match result {
            Ok(CheckResult { entry, newer: true }) => {
                let build = entry.build.clone();
                info!(version = %build.version, date = build.date, source = %entry.source_url, "Update available");
                if let Some(session) = self.slot.get_mut() {
                    session.entry = Some(entry);
                    session.phase = Phase::UpdateAvailable;
                }
                self.emit(UpdateStatus::UpdateAvailable {
                    version: build.version.clone(),
                });
                if let Some(reply) = pending {
                    let _ = reply.send(Ok(CheckOutcome::UpdateAvailable(build)));
                }

                if self.settings.auto_download {
                    let result = self.begin_download().await;
                    let _ = self.guard(result).await;
                }
            }
            Ok(CheckResult { entry, newer: false }) => {
                info!(version = %entry.build.version, "No update available");
                self.set_phase(Phase::NoUpdate);
                self.emit(UpdateStatus::NoUpdate);
                if let Some(reply) = pending {
                    let _ = reply.send(Ok(CheckOutcome::NoUpdate));
                }
            }
            Err(e) => {
                self.fail(&e).await;
                if let Some(reply) = pending {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn on_download_progress(&mut self, progress: DownloadProgress) -> Result<()> {
        let persist_every = self.settings.persist_every_bytes;
        let Some(session) = self.slot.get_mut() else {
            return Ok(());
        };
        let Some(record) = session.record.as_mut() else {
            return Ok(());
        };
        record.bytes_received = progress.bytes_received;

        let due = progress.bytes_received >= session.last_persisted.saturating_add(persist_every);
        if due {
            session.last_persisted = progress.bytes_received;
        }
        let permille = progress.permille();
        let report = session.phase == Phase::Downloading && session.last_permille != Some(permille);
        if report {
            session.last_permille = Some(permille);
        }

        if due {
            self.persist().await?;
        }
        if report {
            self.emit(UpdateStatus::Downloading { progress });
        }
        Ok(())
    }

    async fn on_download_done(
        &mut self,
        result: std::result::Result<DownloadState, DownloadError>,
    ) -> Result<()> {
        let state = result?;
        let phase = self.slot.phase();
        self.record_mut()?.bytes_received = state.bytes_received;

        match (state.status, phase) {
            (DownloadStatus::Completed, Phase::Downloading) => self.begin_verify().await,
            (DownloadStatus::Cancelled, Phase::Paused { .. }) => {
                info!(bytes = state.bytes_received, "Download stopped for pause");
                self.persist().await
            }
            (DownloadStatus::Cancelled, Phase::Downloading) => {
                let relaunch = self
                    .slot
                    .get_mut()
                    .map_or(false, |s| std::mem::take(&mut s.relaunch));
                if relaunch {
                    self.launch_download().await
                } else {
                    Err(UpdateError::Cancelled)
                }
            }
            (status, phase) => {
                debug!(status = ?status, phase = ?phase, "Ignoring download result");
                Ok(())
            }
        }
    }

    async fn on_verify_done(&mut self, result: Result<()>) -> Result<()> {
        result?;
        self.set_phase(Phase::ReadyToApply);
        self.persist_phase(SessionPhase::ReadyToApply).await?;

        let requested = self
            .slot
            .get()
            .and_then(|s| s.record.as_ref())
            .map_or(false, |r| r.apply_requested);
        if self.settings.auto_apply || requested {
            self.start_apply().await?;
        } else {
            info!("Payload verified, waiting for apply");
        }
        Ok(())
    }

    async fn on_engine_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Progress(progress) => {
                let percent = (progress.clamp(0.0, 1.0) * 100.0) as u32;
                let Some(session) = self.slot.get_mut() else {
                    return Ok(());
                };
                if session.apply_percent == Some(percent) {
                    return Ok(());
                }
                session.apply_percent = Some(percent);
                if session.phase == Phase::Applying {
                    self.emit(UpdateStatus::Applying { progress });
                }
                Ok(())
            }
            EngineEvent::Finished(result) => self.on_apply_finished(result).await,
        }
    }

    async fn on_gate_change(&mut self) {
        let can_continue = *self.continue_rx.borrow_and_update();
        let can_start = *self.start_rx.borrow_and_update();

        let result = match self.slot.phase() {
            Phase::Downloading if !can_continue => {
                warn!("Power gate denied, pausing download");
                self.pause_download(PauseReason::PowerGateDenied).await
            }
            Phase::Applying if !can_continue => {
                warn!("Power gate denied, suspending apply");
                if let Err(e) = self.suspend_apply(PauseReason::PowerGateDenied).await {
                    warn!(error = %e, "Apply cannot be suspended, continuing");
                }
                Ok(())
            }
            Phase::Paused {
                reason: PauseReason::PowerGateDenied,
                needs_start,
                ..
            } if (needs_start && can_start) || (!needs_start && can_continue) => {
                info!("Power gate cleared, resuming");
                self.resume_from_pause().await
            }
            _ => Ok(()),
        };
        let _ = self.guard(result).await;
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// UpdateAvailable -> Downloading (or Paused when the gate denies).
    async fn begin_download(&mut self) -> Result<()> {
        let download_dir = self.settings.download_dir.clone();
        let session = self
            .slot
            .get_mut()
            .ok_or_else(|| UpdateError::InvalidState("no session".to_string()))?;
        let entry = session
            .entry
            .clone()
            .ok_or_else(|| UpdateError::InvalidState("no build to download".to_string()))?;

        let path = payload_path(&download_dir, &entry.build);
        let mut record = ResumeRecord::new(session.id, entry.build, path, entry.source_url);
        record.bytes_received = match tokio::fs::metadata(&record.payload_path).await {
            Ok(meta) => meta.len().min(record.descriptor.file_size),
            Err(_) => 0,
        };
        if record.bytes_received > 0 {
            info!(bytes = record.bytes_received, "Found partial payload from an earlier attempt");
        }
        session.last_persisted = record.bytes_received;
        session.record = Some(record);

        if !self.deps.gate.can_start().await {
            return self
                .enter_pause(PausedFrom::Downloading, PauseReason::PowerGateDenied, true)
                .await;
        }

        self.persist().await?;
        self.launch_download().await
    }

    async fn launch_download(&mut self) -> Result<()> {
        let task_id = self.bump_task();
        let session = self
            .slot
            .get_mut()
            .ok_or_else(|| UpdateError::InvalidState("no session".to_string()))?;
        let record = session
            .record
            .as_mut()
            .ok_or_else(|| UpdateError::InvalidState("no session record".to_string()))?;

        let task = match self
            .deps
            .downloader
            .start(
                &record.source_url,
                &record.payload_path,
                record.descriptor.file_size,
            )
            .await
        {
            Ok(task) => task,
            Err(DownloadError::AlreadyRunning(_)) => {
                debug!("Previous transfer still stopping, relaunching when it ends");
                session.relaunch = true;
                session.phase = Phase::Downloading;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            session = %session.id,
            url = %record.source_url,
            offset = record.bytes_received,
            total = record.descriptor.file_size,
            "Downloading payload"
        );
        record.paused = None;
        record.phase = SessionPhase::Downloading;
        session.task = task_id;
        session.phase = Phase::Downloading;
        let progress = DownloadProgress::new(record.bytes_received, record.descriptor.file_size);
        session.last_permille = Some(progress.permille());

        let events = self.events_tx.clone();
        let mut ticks = task.progress();
        tokio::spawn(async move {
            let forward = async {
                while let Some(progress) = ticks.next().await {
                    let _ = events.send(Internal::DownloadProgress {
                        task: task_id,
                        progress,
                    });
                }
            };
            let (_, result) = tokio::join!(forward, task.wait());
            let _ = events.send(Internal::DownloadDone {
                task: task_id,
                result,
            });
        });

        self.persist().await?;
        self.emit(UpdateStatus::Downloading { progress });
        Ok(())
    }

    async fn pause_download(&mut self, reason: PauseReason) -> Result<()> {
        let path = self.record_mut()?.payload_path.clone();
        self.deps.downloader.cancel(&path);
        self.enter_pause(PausedFrom::Downloading, reason, false).await
    }

    async fn enter_pause(
        &mut self,
        from: PausedFrom,
        reason: PauseReason,
        needs_start: bool,
    ) -> Result<()> {
        info!(from = ?from, reason = ?reason, "Pausing update session");
        self.set_phase(Phase::Paused {
            from,
            reason,
            needs_start,
        });
        self.record_mut()?.paused = Some(reason);
        self.persist().await?;
        self.emit(UpdateStatus::Paused { reason });
        Ok(())
    }

    /// Paused -> the phase it paused from, if the gate allows it.
    async fn resume_from_pause(&mut self) -> Result<()> {
        let Phase::Paused {
            from,
            reason,
            needs_start,
        } = self.slot.phase()
        else {
            return Ok(());
        };

        let allowed = if needs_start {
            self.deps.gate.can_start().await
        } else {
            self.deps.gate.can_continue().await
        };
        if !allowed {
            if reason != PauseReason::PowerGateDenied {
                // The user let go, the battery still holds it.
                self.enter_pause(from, PauseReason::PowerGateDenied, needs_start)
                    .await?;
            }
            return Ok(());
        }

        match from {
            PausedFrom::Downloading => {
                let path = self.record_mut()?.payload_path.clone();
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    let record = self.record_mut()?;
                    record.bytes_received = meta.len().min(record.descriptor.file_size);
                }
                self.launch_download().await
            }
            PausedFrom::ReadyToApply => {
                self.set_phase(Phase::ReadyToApply);
                self.start_apply().await
            }
            PausedFrom::Applying => {
                self.deps.engine.resume().await?;
                self.set_phase(Phase::Applying);
                self.record_mut()?.paused = None;
                self.persist().await?;
                let percent = self.slot.get().and_then(|s| s.apply_percent).unwrap_or(0);
                info!(progress = percent, "Apply resumed");
                self.emit(UpdateStatus::Applying {
                    progress: percent as f32 / 100.0,
                });
                Ok(())
            }
        }
    }

    /// Downloading -> Verifying. Hashing runs off the loop.
    async fn begin_verify(&mut self) -> Result<()> {
        let task = self.bump_task();
        self.set_phase(Phase::Verifying);
        self.persist_phase(SessionPhase::Verifying).await?;

        let record = self.record_mut()?;
        let path = record.payload_path.clone();
        let digest = record.descriptor.sha_512.clone();
        if let Some(session) = self.slot.get_mut() {
            session.task = task;
        }
        self.emit(UpdateStatus::Verifying);

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = verify_or_discard(&path, &digest).await;
            let _ = events.send(Internal::VerifyDone { task, result });
        });
        Ok(())
    }

    /// ReadyToApply -> Applying (or Paused when the gate denies).
    #[instrument(skip(self))]
    async fn start_apply(&mut self) -> Result<()> {
        if !self.deps.gate.can_start().await {
            return self
                .enter_pause(PausedFrom::ReadyToApply, PauseReason::PowerGateDenied, true)
                .await;
        }

        let record = self.record_mut()?;
        record.paused = None;
        let payload = record.payload_path.clone();
        self.set_phase(Phase::Applying);
        self.persist_phase(SessionPhase::Applying).await?;
        if let Some(session) = self.slot.get_mut() {
            session.apply_percent = Some(0);
        }
        self.emit(UpdateStatus::Applying { progress: 0.0 });

        match self.deps.engine.prepare(&payload).await? {
            Preparation::RebootScheduled => {
                info!(engine = %self.deps.engine.kind(), "Rebooting into apply mode");
                Ok(())
            }
            Preparation::Ready => self.launch_apply(&payload).await,
        }
    }

    async fn launch_apply(&mut self, payload: &Path) -> Result<()> {
        let task = self.bump_task();
        let (tx, rx) = mpsc::unbounded_channel();
        let _timer = TimedOperation::start("submit_payload");
        self.deps.engine.apply(payload, tx).await?;
        info!(engine = %self.deps.engine.kind(), payload = %payload.display(), "Apply started");
        self.forward_engine_events(task, rx);
        Ok(())
    }

    fn forward_engine_events(&mut self, task: u64, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        if let Some(session) = self.slot.get_mut() {
            session.task = task;
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(Internal::Engine { task, event }).is_err() {
                    break;
                }
            }
        });
    }

    async fn suspend_apply(&mut self, reason: PauseReason) -> Result<()> {
        self.deps.engine.suspend().await?;
        self.enter_pause(PausedFrom::Applying, reason, false).await
    }

    async fn on_apply_finished(&mut self, result: ApplyResult) -> Result<()> {
        match self.slot.phase() {
            Phase::Applying
            | Phase::Paused {
                from: PausedFrom::Applying,
                ..
            } => {}
            phase => {
                debug!(phase = ?phase, result = ?result, "Ignoring apply result");
                return Ok(());
            }
        }

        match result {
            ApplyResult::Failed { code } => {
                warn!(code, "Platform apply failed");
                Err(UpdateError::PlatformApply { code })
            }
            ApplyResult::Succeeded | ApplyResult::NeedsReboot => {
                info!(result = ?result, "Apply succeeded");
                self.finalize().await
            }
        }
    }

    /// Applying -> Finalizing.
    async fn finalize(&mut self) -> Result<()> {
        self.set_phase(Phase::Finalizing);
        self.persist_phase(SessionPhase::Finalizing).await?;

        let finalization = self.deps.engine.finalize().await?;
        info!(
            target_slot = ?finalization.target_slot,
            reboot_required = finalization.reboot_required,
            "Update staged, reboot to complete"
        );
        self.record_mut()?.finalization = Some(finalization);
        self.persist().await?;

        self.emit(UpdateStatus::AppliedPendingReboot);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Rebuild the session from the journal.
    async fn recover(&mut self) {
        let record = match self.journal.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session record");
                if let Err(e) = self.journal.clear().await {
                    warn!(error = %e, "Failed to clear session record");
                }
                return;
            }
        };

        info!(
            session = %record.session,
            phase = ?record.phase,
            bytes = record.bytes_received,
            version = %record.descriptor.version,
            "Recovering update session"
        );
        let phase = record.phase;
        self.slot.0 = Some(Session::from_record(record, Phase::Idle));

        let result = match phase {
            SessionPhase::Downloading => self.recover_download().await,
            SessionPhase::Verifying | SessionPhase::ReadyToApply => self.begin_verify().await,
            SessionPhase::Applying => self.recover_apply().await,
            SessionPhase::Finalizing => self.recover_finalize().await,
        };
        let _ = self.guard(result).await;
    }

    async fn recover_download(&mut self) -> Result<()> {
        let record = self.record_mut()?;
        let path = record.payload_path.clone();
        let recorded = record.bytes_received;
        let paused = record.paused;

        let on_disk = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let offset = on_disk.min(recorded);
        if on_disk > offset {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| UpdateError::Disk(e.to_string()))?;
            file.set_len(offset)
                .await
                .map_err(|e| UpdateError::Disk(e.to_string()))?;
            file.sync_all()
                .await
                .map_err(|e| UpdateError::Disk(e.to_string()))?;
        }
        info!(offset, on_disk, recorded, "Aligned partial payload");
        self.record_mut()?.bytes_received = offset;

        match paused {
            Some(PauseReason::UserRequested) => {
                self.enter_pause(PausedFrom::Downloading, PauseReason::UserRequested, offset == 0)
                    .await
            }
            _ => {
                if self.deps.gate.can_continue().await {
                    self.launch_download().await
                } else {
                    self.enter_pause(PausedFrom::Downloading, PauseReason::PowerGateDenied, offset == 0)
                        .await
                }
            }
        }
    }

    /// Ask the engine what happened to the apply instead of guessing.
    async fn recover_apply(&mut self) -> Result<()> {
        let status = self.deps.engine.status().await?;
        info!(status = ?status, "Engine status after restart");

        match status {
            EngineStatus::Idle => {
                // Nothing in flight: check the payload again, then apply.
                self.record_mut()?.apply_requested = true;
                self.begin_verify().await
            }
            EngineStatus::Applying { progress } | EngineStatus::Suspended { progress } => {
                let suspended = matches!(status, EngineStatus::Suspended { .. });
                let task = self.bump_task();
                let (tx, rx) = mpsc::unbounded_channel();
                self.deps.engine.attach(tx).await?;
                self.forward_engine_events(task, rx);
                if let Some(session) = self.slot.get_mut() {
                    session.apply_percent = Some((progress * 100.0) as u32);
                }

                let paused = self.record_mut()?.paused;
                match (suspended, paused) {
                    (true, Some(reason)) => {
                        self.enter_pause(PausedFrom::Applying, reason, false).await
                    }
                    (true, None) => {
                        self.deps.engine.resume().await?;
                        self.set_phase(Phase::Applying);
                        self.emit(UpdateStatus::Applying { progress });
                        Ok(())
                    }
                    (false, _) => {
                        self.set_phase(Phase::Applying);
                        self.record_mut()?.paused = None;
                        self.persist().await?;
                        self.emit(UpdateStatus::Applying { progress });
                        Ok(())
                    }
                }
            }
            EngineStatus::Finished(result) => {
                self.set_phase(Phase::Applying);
                self.on_apply_finished(result).await
            }
        }
    }

    async fn recover_finalize(&mut self) -> Result<()> {
        self.set_phase(Phase::Finalizing);
        let staged = match self.record_mut()?.finalization.clone() {
            Some(staged) => staged,
            None => {
                // Finalization did not complete before the restart.
                let staged = self.deps.engine.finalize().await?;
                self.record_mut()?.finalization = Some(staged.clone());
                self.persist().await?;
                staged
            }
        };

        match self.deps.engine.confirm_boot(&staged).await? {
            BootCheck::Confirmed => {
                let record = self
                    .slot
                    .get_mut()
                    .and_then(|s| s.record.take())
                    .ok_or_else(|| UpdateError::InvalidState("no session record".to_string()))?;
                self.deps.store.set_last_applied_build(&record.descriptor).await?;
                remove_payload(&record.payload_path).await;
                self.journal.clear().await?;

                info!(version = %record.descriptor.version, "Update applied");
                self.set_phase(Phase::Applied);
                self.emit(UpdateStatus::Applied);
                Ok(())
            }
            BootCheck::Pending => {
                info!("Waiting for reboot into the new build");
                self.emit(UpdateStatus::AppliedPendingReboot);
                Ok(())
            }
            BootCheck::RolledBack => {
                if let EngineStatus::Finished(ApplyResult::Failed { code }) =
                    self.deps.engine.status().await?
                {
                    return Err(UpdateError::PlatformApply { code });
                }
                Err(UpdateError::RolledBack)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(sha: &str) -> BuildDescriptor {
        let mut build = BuildDescriptor::installed("14".into(), 1, None);
        build.sha_512 = sha.to_string();
        build.file_name = "ota.zip".into();
        build
    }

    #[test]
    fn test_payload_path_is_keyed_by_digest() {
        let dir = Path::new("/data/ota");
        let path = payload_path(dir, &build(&"AB".repeat(64)));
        assert_eq!(path, PathBuf::from("/data/ota/abababababababab-ota.zip"));
        assert_eq!(
            payload_path(dir, &build("abc")),
            PathBuf::from("/data/ota/abc-ota.zip")
        );
    }

    #[test]
    fn test_slot_rejects_second_active_session() {
        let mut slot = SessionSlot::default();
        let first = Uuid::new_v4();
        slot.occupy(Session::new(first, Phase::Downloading)).unwrap();

        let err = slot
            .occupy(Session::new(Uuid::new_v4(), Phase::Checking))
            .err()
            .unwrap();
        assert!(matches!(err, UpdateError::Busy));
        assert_eq!(slot.get().map(|s| s.id), Some(first));
        assert_eq!(slot.phase(), Phase::Downloading);
    }

    #[test]
    fn test_slot_replaces_finished_session() {
        let mut slot = SessionSlot::default();
        slot.occupy(Session::new(
            Uuid::new_v4(),
            Phase::Failed {
                reason: FailureReason::Network,
            },
        ))
        .unwrap();
        let next = Uuid::new_v4();
        slot.occupy(Session::new(next, Phase::Checking)).unwrap();
        assert_eq!(slot.get().map(|s| s.id), Some(next));
    }

    #[test]
    fn test_active_phases() {
        assert!(Phase::Verifying.is_active());
        assert!(Phase::Paused {
            from: PausedFrom::Downloading,
            reason: PauseReason::PowerGateDenied,
            needs_start: false
        }
        .is_active());
        assert!(!Phase::UpdateAvailable.is_active());
        assert!(!Phase::Applied.is_active());
    }
}
