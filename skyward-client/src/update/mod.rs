//! # OTA Update Module
//!
//! Checks a remote build manifest, downloads and verifies the payload and
//! hands it to the device's update engine.
//!
//! ## Features
//! - Manifest checks with bounded retries and source reachability probing
//! - Resumable downloads using HTTP range requests
//! - SHA-512 payload verification
//! - Battery gating of downloads and applies
//! - A/B and A-only apply flows with boot confirmation
//! - Session recovery across process restarts and reboots
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ Manifest Server │◄────┤  Update Orchestrator │
//! └─────────────────┘     └──────────┬───────────┘
//!         │ payload                  │
//!         ▼                          ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ Download Engine │────►│  Verifier → Engine   │
//! │  download_dir/  │     │  (A/B or A-only)     │
//! └─────────────────┘     └──────────────────────┘
//! ```

mod device;
mod downloader;
mod error;
mod manifest;
mod orchestrator;
mod resume;
mod retry;
mod scheduler;
mod status;
mod store;
mod verifier;

pub use device::{installed_build, parse_build_prop, read_installed_build};
pub use downloader::{DownloadEngine, DownloadState, DownloadStatus, DownloadTask};
pub use error::{DownloadError, Result, StoreError, UpdateError};
pub use manifest::{
    is_newer, select_source, BuildDescriptor, DownloadSources, ManifestClient, ManifestDocument,
    ManifestEntry, ManifestSource,
};
pub use orchestrator::{
    CheckOutcome, Orchestrator, OrchestratorDeps, OrchestratorHandle, OrchestratorSettings,
    PausedFrom, Phase, SessionSnapshot,
};
pub use resume::{ResumeJournal, ResumeRecord, SessionPhase};
pub use retry::RetryPolicy;
pub use scheduler::{next_check_delay, spawn_scheduler};
pub use status::{
    DownloadProgress, FailureReason, PauseReason, StatusEvent, StatusFilter, UpdateStatus,
};
pub use store::{BuildStore, JsonFileStore, MemoryStore, StoreResult};
pub use verifier::{sha512_file, verify, verify_or_discard};
