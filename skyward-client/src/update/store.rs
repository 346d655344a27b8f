//! Persistence Store: small durable key/value state.
//!
//! Holds the last applied build, the last check time and the changelog
//! history. Values survive restarts; every write replaces the file
//! atomically (write to `.tmp`, fsync, rename).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::StoreError;
use super::manifest::BuildDescriptor;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable client state.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn last_applied_build(&self) -> StoreResult<Option<BuildDescriptor>>;

    async fn set_last_applied_build(&self, build: &BuildDescriptor) -> StoreResult<()>;

    async fn last_checked_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn set_last_checked_time(&self, at: DateTime<Utc>) -> StoreResult<()>;

    /// Changelogs keyed by build date (ms), oldest first.
    async fn changelogs(&self) -> StoreResult<BTreeMap<i64, String>>;

    async fn add_changelog(&self, build_date: i64, text: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoreContents {
    last_applied_build: Option<BuildDescriptor>,
    last_checked_time: Option<DateTime<Utc>>,
    changelogs: BTreeMap<i64, String>,
}

/// Replace `path` with the JSON form of `value`.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(&json).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Read JSON from `path`. A missing file is `None`.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Store backed by a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub const FILE_NAME: &'static str = "store.json";

    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(Self::FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<StoreContents> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn update<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreContents) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        f(&mut contents);
        write_json_atomic(&self.path, &contents).await?;
        debug!(path = %self.path.display(), "Store updated");
        Ok(())
    }
}

#[async_trait]
impl BuildStore for JsonFileStore {
    async fn last_applied_build(&self) -> StoreResult<Option<BuildDescriptor>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.last_applied_build)
    }

    async fn set_last_applied_build(&self, build: &BuildDescriptor) -> StoreResult<()> {
        info!(version = %build.version, date = build.date, "Recording applied build");
        let build = build.clone();
        self.update(move |c| c.last_applied_build = Some(build)).await
    }

    async fn last_checked_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.last_checked_time)
    }

    async fn set_last_checked_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(move |c| c.last_checked_time = Some(at)).await
    }

    async fn changelogs(&self) -> StoreResult<BTreeMap<i64, String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.changelogs)
    }

    async fn add_changelog(&self, build_date: i64, text: &str) -> StoreResult<()> {
        let text = text.to_string();
        self.update(move |c| {
            c.changelogs.insert(build_date, text);
        })
        .await
    }
}

/// Volatile store for tests and dev mode.
#[derive(Default)]
pub struct MemoryStore {
    contents: Mutex<StoreContents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn last_applied_build(&self) -> StoreResult<Option<BuildDescriptor>> {
        Ok(self.contents.lock().await.last_applied_build.clone())
    }

    async fn set_last_applied_build(&self, build: &BuildDescriptor) -> StoreResult<()> {
        self.contents.lock().await.last_applied_build = Some(build.clone());
        Ok(())
    }

    async fn last_checked_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.contents.lock().await.last_checked_time)
    }

    async fn set_last_checked_time(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.contents.lock().await.last_checked_time = Some(at);
        Ok(())
    }

    async fn changelogs(&self) -> StoreResult<BTreeMap<i64, String>> {
        Ok(self.contents.lock().await.changelogs.clone())
    }

    async fn add_changelog(&self, build_date: i64, text: &str) -> StoreResult<()> {
        self.contents
            .lock()
            .await
            .changelogs
            .insert(build_date, text.to_string());
        Ok(())
    }
}
