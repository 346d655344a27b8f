//! Download Engine: resumable payload downloads over HTTP(S).
//!
//! - Resumes with `Range: bytes=N-` when the destination already holds
//!   `N` bytes; a `200 OK` answer truncates and restarts from zero
//! - Retries transient network errors with bounded exponential backoff;
//!   the attempt counter resets whenever a try made progress
//! - Local I/O errors and size mismatches are fatal
//! - Cancellation stops at the next chunk boundary and leaves the partial
//!   file on disk with an accurate byte count

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, instrument, warn};

use super::error::DownloadError;
use super::retry::RetryPolicy;
use super::status::DownloadProgress;

/// Longest silence tolerated between two body chunks.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Running,
    Paused,
    /// All bytes are on disk.
    Completed,
    Verifying,
    Verified,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Verified
                | DownloadStatus::Failed
                | DownloadStatus::Cancelled
        )
    }
}

/// A download, identified by its destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    pub path: PathBuf,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
}

impl DownloadState {
    pub fn new(path: PathBuf, bytes_received: u64, total_bytes: u64) -> Self {
        Self {
            path,
            bytes_received,
            total_bytes,
            status: DownloadStatus::Pending,
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress::new(self.bytes_received, self.total_bytes)
    }
}

/// Finite progress stream over a state channel. Nothing is yielded after the
/// first terminal state; the stream closes once the job drops its sender.
fn progress_stream(rx: watch::Receiver<DownloadState>) -> BoxStream<'static, DownloadProgress> {
    WatchStream::new(rx)
        .scan(false, |done, state| {
            let item = if *done {
                None
            } else {
                *done = state.status.is_terminal();
                Some(state.progress())
            };
            futures::future::ready(item)
        })
        .boxed()
}

/// Handle to a running download.
pub struct DownloadTask {
    path: PathBuf,
    state: watch::Receiver<DownloadState>,
    handle: JoinHandle<Result<DownloadState, DownloadError>>,
}

impl DownloadTask {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> DownloadState {
        self.state.borrow().clone()
    }

    /// A fresh progress stream starting from the current state.
    pub fn progress(&self) -> BoxStream<'static, DownloadProgress> {
        progress_stream(self.state.clone())
    }

    /// Wait for the download to finish.
    pub async fn wait(self) -> Result<DownloadState, DownloadError> {
        self.handle
            .await
            .map_err(|e| DownloadError::Internal(format!("download task failed: {}", e)))?
    }
}

struct ActiveDownload {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<DownloadState>,
}

/// Starts, tracks and cancels downloads keyed by destination path.
pub struct DownloadEngine {
    client: reqwest::Client,
    retry: RetryPolicy,
    stall_timeout: Duration,
    active: Mutex<HashMap<PathBuf, ActiveDownload>>,
}

impl DownloadEngine {
    pub fn new(client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    fn active(&self) -> MutexGuard<'_, HashMap<PathBuf, ActiveDownload>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start (or resume) downloading `url` into `dest`. Finished downloads
    /// are forgotten here.
    pub async fn start(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
    ) -> Result<DownloadTask, DownloadError> {
        // Seed with the partial file so the first progress tick never goes back.
        let existing = match fs::metadata(dest).await {
            Ok(meta) => meta.len().min(expected_size),
            Err(_) => 0,
        };

        let mut active = self.active();
        active.retain(|_, download| !download.state.borrow().status.is_terminal());
        if active.contains_key(dest) {
            return Err(DownloadError::AlreadyRunning(dest.to_path_buf()));
        }

        let (state_tx, state_rx) = watch::channel(DownloadState::new(
            dest.to_path_buf(),
            existing,
            expected_size,
        ));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let job = DownloadJob {
            client: self.client.clone(),
            retry: self.retry,
            stall_timeout: self.stall_timeout,
            url: url.to_string(),
            dest: dest.to_path_buf(),
            expected: expected_size,
            state: state_tx,
            cancel: cancel_rx,
        };
        let handle = tokio::spawn(job.run());

        active.insert(
            dest.to_path_buf(),
            ActiveDownload {
                cancel: cancel_tx,
                state: state_rx.clone(),
            },
        );

        Ok(DownloadTask {
            path: dest.to_path_buf(),
            state: state_rx,
            handle,
        })
    }

    /// Ask the download into `dest` to stop. Returns whether one was running.
    pub fn cancel(&self, dest: &Path) -> bool {
        let active = self.active();
        match active.get(dest) {
            Some(download) if !download.state.borrow().status.is_terminal() => {
                download.cancel.send_replace(true);
                debug!(path = %dest.display(), "Download cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Progress of the download into `dest`, if one was started.
    pub fn progress(&self, dest: &Path) -> Option<BoxStream<'static, DownloadProgress>> {
        self.active()
            .get(dest)
            .map(|download| progress_stream(download.state.clone()))
    }

    pub fn state(&self, dest: &Path) -> Option<DownloadState> {
        self.active()
            .get(dest)
            .map(|download| download.state.borrow().clone())
    }
}

/// Parse `Content-Range: bytes start-end/total` into `(start, total)`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

/// Resolves once cancellation has been requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct DownloadJob {
    client: reqwest::Client,
    retry: RetryPolicy,
    stall_timeout: Duration,
    url: String,
    dest: PathBuf,
    expected: u64,
    state: watch::Sender<DownloadState>,
    cancel: watch::Receiver<bool>,
}

impl DownloadJob {
    async fn run(mut self) -> Result<DownloadState, DownloadError> {
        let result = self.download().await;
        match &result {
            Ok(status) => {
                let status = *status;
                self.state.send_modify(|s| s.status = status);
            }
            Err(e) => {
                error!(url = %self.url, error = %e, "Download failed");
                self.state.send_modify(|s| s.status = DownloadStatus::Failed);
            }
        }
        let state = self.state.borrow().clone();
        result.map(|_| state)
    }

    async fn current_len(&self) -> Result<u64, DownloadError> {
        match fs::metadata(&self.dest).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(DownloadError::Disk(e)),
        }
    }

    #[instrument(skip(self), fields(url = %self.url, dest = %self.dest.display()))]
    async fn download(&mut self) -> Result<DownloadStatus, DownloadError> {
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut failures: u32 = 0;
        loop {
            if *self.cancel.borrow() {
                return Ok(DownloadStatus::Cancelled);
            }

            let before = self.current_len().await?;
            let error = match self.transfer(before).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if self.current_len().await? > before {
                failures = 0;
            }
            failures += 1;
            if !self.retry.should_retry(failures) {
                return Err(DownloadError::RetriesExhausted {
                    attempts: failures,
                    last: error.to_string(),
                });
            }

            let delay = self.retry.delay(failures - 1);
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Download interrupted, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut self.cancel) => return Ok(DownloadStatus::Cancelled),
            }
        }
    }

    /// One HTTP exchange, starting at `offset`.
    async fn transfer(&mut self, mut offset: u64) -> Result<DownloadStatus, DownloadError> {
        if offset > self.expected {
            warn!(offset, expected = self.expected, "Partial file larger than payload, discarding");
            File::create(&self.dest).await?;
            offset = 0;
        }
        if offset > 0 && offset == self.expected {
            self.state.send_modify(|s| s.bytes_received = offset);
            info!("Payload already fully downloaded");
            return Ok(DownloadStatus::Completed);
        }

        self.state.send_modify(|s| {
            s.bytes_received = offset;
            s.status = DownloadStatus::Running;
        });

        let mut request = self.client.get(&self.url);
        if offset > 0 {
            info!(offset, total = self.expected, "Resuming download");
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = cancelled(&mut self.cancel) => return Ok(DownloadStatus::Cancelled),
        };

        let status = response.status();
        let mut file = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            let range = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            if let Some((start, total)) = range {
                if let Some(total) = total {
                    if total != self.expected {
                        return Err(DownloadError::SizeMismatch {
                            expected: self.expected,
                            actual: total,
                        });
                    }
                }
                if start != offset {
                    File::create(&self.dest).await?;
                    return Err(DownloadError::Network(format!(
                        "server resumed at byte {} instead of {}",
                        start, offset
                    )));
                }
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.dest)
                .await?
        } else if status == reqwest::StatusCode::OK {
            if offset > 0 {
                warn!(offset, "Server ignored range request, restarting from zero");
            }
            if let Some(length) = response.content_length() {
                if length != self.expected {
                    return Err(DownloadError::SizeMismatch {
                        expected: self.expected,
                        actual: length,
                    });
                }
            }
            offset = 0;
            File::create(&self.dest).await?
        } else if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            File::create(&self.dest).await?;
            return Err(DownloadError::Network(
                "range not satisfiable, restarting from zero".to_string(),
            ));
        } else if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(DownloadError::Network(format!("server returned {}", status)));
        } else {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        };

        self.state.send_modify(|s| s.bytes_received = offset);

        let mut written = offset;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
                _ = cancelled(&mut self.cancel) => {
                    file.flush().await?;
                    file.sync_all().await?;
                    info!(bytes = written, "Download cancelled");
                    return Ok(DownloadStatus::Cancelled);
                }
            };

            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(DownloadError::Network(format!(
                        "no data for {}s",
                        self.stall_timeout.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(DownloadError::Network(e.to_string()));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            if written + len > self.expected {
                return Err(DownloadError::SizeMismatch {
                    expected: self.expected,
                    actual: written + len,
                });
            }
            file.write_all(&chunk).await?;
            written += len;
            self.state.send_modify(|s| s.bytes_received = written);
        }

        file.flush().await?;
        file.sync_all().await?;

        if written < self.expected {
            return Err(DownloadError::Network(format!(
                "connection closed after {} of {} bytes",
                written, self.expected
            )));
        }

        info!(bytes = written, "Download complete");
        Ok(DownloadStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-999/1000"),
            Some((100, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, None)));
        assert_eq!(parse_content_range("items 0-9/10"), None);
        assert_eq!(parse_content_range("bytes x-9/10"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Cancelled.is_terminal());
        assert!(!DownloadStatus::Running.is_terminal());
        assert!(!DownloadStatus::Paused.is_terminal());
    }

    #[tokio::test]
    async fn test_progress_stream_ends_after_terminal_state() {
        let (tx, rx) = watch::channel(DownloadState::new(PathBuf::from("/tmp/p"), 0, 10));
        let mut stream = progress_stream(rx);

        assert_eq!(stream.next().await, Some(DownloadProgress::new(0, 10)));
        tx.send_modify(|s| {
            s.bytes_received = 10;
            s.status = DownloadStatus::Completed;
        });
        assert_eq!(stream.next().await, Some(DownloadProgress::new(10, 10)));
        tx.send_modify(|s| s.bytes_received = 11);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload.zip");
        let engine = DownloadEngine::new(
            reqwest::Client::new(),
            RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 10,
                max_delay_ms: 20,
            },
        );

        let task = engine
            .start("http://127.0.0.1:9/payload.zip", &dest, 16)
            .await
            .unwrap();
        let err = task.wait().await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(engine.state(&dest).unwrap().status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_disk_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is needed.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let dest = blocker.join("payload.zip");

        let engine = DownloadEngine::new(reqwest::Client::new(), RetryPolicy::default());
        let task = engine
            .start("http://127.0.0.1:9/payload.zip", &dest, 16)
            .await
            .unwrap();
        let err = task.wait().await.unwrap_err();
        assert!(matches!(err, DownloadError::Disk(_)));
    }

    #[tokio::test]
    async fn test_finished_downloads_are_pruned_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let failed = blocker.join("payload.zip");
        let engine = DownloadEngine::new(reqwest::Client::new(), RetryPolicy::default());

        let task = engine
            .start("http://127.0.0.1:9/payload.zip", &failed, 16)
            .await
            .unwrap();
        assert!(task.wait().await.is_err());
        assert_eq!(engine.state(&failed).unwrap().status, DownloadStatus::Failed);

        // Starting anything drops the finished entry.
        let other = blocker.join("other.zip");
        let task = engine
            .start("http://127.0.0.1:9/other.zip", &other, 16)
            .await
            .unwrap();
        assert!(engine.state(&failed).is_none());
        assert!(task.wait().await.is_err());

        // The same destination can be started again once finished.
        let task = engine
            .start("http://127.0.0.1:9/payload.zip", &failed, 16)
            .await
            .unwrap();
        assert!(matches!(task.wait().await, Err(DownloadError::Disk(_))));
        assert_eq!(engine.active().len(), 1);
    }
}
