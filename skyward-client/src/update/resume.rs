//! Resume journal: the in-flight session, persisted before every phase
//! change so a restart can pick up where the previous process stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use skyward_engine::Finalization;

use super::error::StoreError;
use super::manifest::BuildDescriptor;
use super::status::PauseReason;
use super::store::{read_json, write_json_atomic, StoreResult};

/// Durable phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Downloading,
    Verifying,
    ReadyToApply,
    Applying,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub session: Uuid,
    pub descriptor: BuildDescriptor,
    pub phase: SessionPhase,
    pub bytes_received: u64,
    pub payload_path: PathBuf,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<PauseReason>,
    /// Apply was asked for before the payload was ready.
    #[serde(default)]
    pub apply_requested: bool,
    /// What finalization staged. Set once the build is bootable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalization: Option<Finalization>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(
        session: Uuid,
        descriptor: BuildDescriptor,
        payload_path: PathBuf,
        source_url: String,
    ) -> Self {
        Self {
            session,
            descriptor,
            phase: SessionPhase::Downloading,
            bytes_received: 0,
            payload_path,
            source_url,
            paused: None,
            apply_requested: false,
            finalization: None,
            updated_at: Utc::now(),
        }
    }
}

/// Single-record journal file.
#[derive(Debug, Clone)]
pub struct ResumeJournal {
    path: PathBuf,
}

impl ResumeJournal {
    pub const FILE_NAME: &'static str = "session.json";

    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> StoreResult<Option<ResumeRecord>> {
        read_json(&self.path).await
    }

    pub async fn save(&self, record: &mut ResumeRecord) -> StoreResult<()> {
        record.updated_at = Utc::now();
        write_json_atomic(&self.path, record).await?;
        debug!(
            session = %record.session,
            phase = ?record.phase,
            bytes = record.bytes_received,
            "Session persisted"
        );
        Ok(())
    }

    pub async fn clear(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Cleared session record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyward_engine::Slot;

    fn record() -> ResumeRecord {
        let mut build = BuildDescriptor::installed("14".into(), 1_700_000_000_000, None);
        build.file_name = "ota.zip".into();
        build.file_size = 10;
        ResumeRecord::new(
            Uuid::new_v4(),
            build,
            PathBuf::from("/data/ota/ota.zip"),
            "http://mirror/ota.zip".into(),
        )
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResumeJournal::new(dir.path());
        assert!(journal.load().await.unwrap().is_none());

        let mut rec = record();
        rec.phase = SessionPhase::Applying;
        rec.finalization = Some(Finalization {
            target_slot: Some(Slot::B),
            reboot_required: true,
            boot_id: Some("0d1e2f".into()),
        });
        journal.save(&mut rec).await.unwrap();

        let loaded = journal.load().await.unwrap().unwrap();
        assert_eq!(loaded, rec);

        journal.clear().await.unwrap();
        journal.clear().await.unwrap();
        assert!(journal.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResumeJournal::new(dir.path());

        let mut rec = record();
        journal.save(&mut rec).await.unwrap();
        rec.bytes_received = 7;
        rec.paused = Some(PauseReason::UserRequested);
        journal.save(&mut rec).await.unwrap();

        let loaded = journal.load().await.unwrap().unwrap();
        assert_eq!(loaded.bytes_received, 7);
        assert_eq!(loaded.paused, Some(PauseReason::UserRequested));
    }
}
