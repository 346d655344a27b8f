//! Logging initialization using tracing.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{debug, info};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production devices that ship logs off-box.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Logs how long an operation took.
///
/// Call [`TimedOperation::finish`] on success. If the value is dropped without
/// finishing (early return through `?`), the elapsed time is still logged at
/// debug level as an abandoned operation.
pub struct TimedOperation {
    name: &'static str,
    started: Instant,
    finished: bool,
}

impl TimedOperation {
    /// Start timing an operation.
    pub fn start(name: &'static str) -> Self {
        debug!(operation = name, "Operation started");
        Self {
            name,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Time elapsed since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mark the operation as complete and log its duration.
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.elapsed();
        info!(
            operation = self.name,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation completed"
        );
        elapsed
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                operation = self.name,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Operation abandoned"
            );
        }
    }
}
