//! A/B apply mechanism backed by the platform `update_engine_client` tool.
//!
//! The tool is run with `--follow`, which keeps it attached to the daemon and
//! prints one line per callback:
//!
//! ```text
//! onStatusUpdate(UPDATE_STATUS_DOWNLOADING (3), 0.412)
//! onPayloadApplicationComplete(ErrorCode::kSuccess (0))
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::traits::ApplyMechanism;
use crate::types::{ApplyMode, MechanismStatus, RawCallback};

/// Name of the sidecar file carrying the payload headers.
const PAYLOAD_PROPERTIES: &str = "payload_properties.txt";

/// How long a status query waits for the first callback line.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse one line of `update_engine_client --follow` output.
pub fn parse_follow_line(line: &str) -> Option<RawCallback> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("onStatusUpdate(") {
        let inner = rest.strip_suffix(')')?;
        let (status_part, progress_part) = inner.rsplit_once(',')?;
        let status = code_in_parens(status_part)?;
        let progress = progress_part.trim().parse::<f32>().ok()?;
        return Some(RawCallback::StatusUpdate { status, progress });
    }
    if let Some(rest) = line.strip_prefix("onPayloadApplicationComplete(") {
        let inner = rest.strip_suffix(')')?;
        let error_code = code_in_parens(inner)?;
        return Some(RawCallback::PayloadApplicationComplete { error_code });
    }
    None
}

/// Extract `N` from `NAME (N)`.
fn code_in_parens(s: &str) -> Option<i32> {
    let s = s.trim();
    let open = s.rfind('(')?;
    let close = s.rfind(')')?;
    if close <= open {
        return None;
    }
    s[open + 1..close].trim().parse().ok()
}

/// Drives the platform daemon through its command line client.
pub struct ClientMechanism {
    binary: PathBuf,
    follower: tokio::sync::Mutex<Option<Child>>,
}

impl ClientMechanism {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            follower: tokio::sync::Mutex::new(None),
        }
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                EngineError::Unavailable(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Unavailable(format!(
                "{} {} failed: {}",
                self.binary.display(),
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Spawn `--follow` with extra args and forward parsed lines.
    async fn follow(
        &self,
        extra: Vec<String>,
        callbacks: mpsc::UnboundedSender<RawCallback>,
    ) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .args(&extra)
            .arg("--follow")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Unavailable(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("follower has no stdout".to_string()))?;

        let mut previous = self.follower.lock().await;
        if let Some(mut old) = previous.take() {
            let _ = old.start_kill();
        }
        *previous = Some(child);
        drop(previous);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_follow_line(&line) {
                        Some(callback) => {
                            let terminal =
                                matches!(callback, RawCallback::PayloadApplicationComplete { .. });
                            if callbacks.send(callback).is_err() || terminal {
                                break;
                            }
                        }
                        None => debug!(line = %line, "Ignoring follower output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Follower output stream failed");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Headers stored next to the payload, one `KEY=VALUE` per line.
async fn payload_headers(payload: &Path) -> Result<Option<String>> {
    let Some(dir) = payload.parent() else {
        return Ok(None);
    };
    match tokio::fs::read_to_string(dir.join(PAYLOAD_PROPERTIES)).await {
        Ok(content) => {
            let headers: Vec<&str> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            Ok(Some(headers.join("\n")))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ApplyMechanism for ClientMechanism {
    #[instrument(skip(self, callbacks), fields(payload = %payload.display()))]
    async fn submit(
        &self,
        payload: &Path,
        mode: ApplyMode,
        callbacks: mpsc::UnboundedSender<RawCallback>,
    ) -> Result<()> {
        let payload_arg = match mode {
            ApplyMode::Streaming => payload.display().to_string(),
            ApplyMode::BlockBased => format!("file://{}", payload.display()),
        };

        let mut args = vec!["--update".to_string(), format!("--payload={}", payload_arg)];
        if mode == ApplyMode::BlockBased {
            let size = tokio::fs::metadata(payload).await?.len();
            args.push("--offset=0".to_string());
            args.push(format!("--size={}", size));
        }
        if let Some(headers) = payload_headers(payload).await? {
            args.push(format!("--headers={}", headers));
        }

        self.follow(args, callbacks).await?;
        info!(mode = ?mode, "Submitted payload to update_engine");
        Ok(())
    }

    async fn bind(&self, callbacks: mpsc::UnboundedSender<RawCallback>) -> Result<()> {
        self.follow(Vec::new(), callbacks).await
    }

    async fn cancel(&self) -> Result<()> {
        self.run(&["--cancel".to_string()]).await
    }

    async fn suspend(&self) -> Result<()> {
        self.run(&["--suspend".to_string()]).await
    }

    async fn resume(&self) -> Result<()> {
        self.run(&["--resume".to_string()]).await
    }

    /// The daemon reports its current status as the first follow line.
    async fn query(&self) -> Result<MechanismStatus> {
        let mut child = Command::new(&self.binary)
            .arg("--follow")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Unavailable(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("query has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let first = tokio::time::timeout(QUERY_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(callback) = parse_follow_line(&line) {
                    return Ok::<_, std::io::Error>(Some(callback));
                }
            }
            Ok(None)
        })
        .await
        .map_err(|_| EngineError::Unavailable("update_engine did not report status".into()))??;
        let _ = child.start_kill();

        match first {
            Some(RawCallback::StatusUpdate { status, progress }) => Ok(MechanismStatus {
                status,
                progress,
                last_error: None,
            }),
            Some(RawCallback::PayloadApplicationComplete { error_code }) => {
                Ok(MechanismStatus {
                    status: crate::types::status_code::IDLE,
                    progress: 0.0,
                    last_error: Some(error_code),
                })
            }
            None => Err(EngineError::Protocol(
                "update_engine closed without reporting status".to_string(),
            )),
        }
    }
}
