//! Periodic update checks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::UpdateError;
use super::orchestrator::{CheckOutcome, OrchestratorHandle};
use super::store::BuildStore;

/// Time until the next check is due, given when the last one ran.
pub fn next_check_delay(
    last_checked: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> Duration {
    let Some(last) = last_checked else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

/// Run a check every `interval`, the first one as soon as the previous
/// process's last check is `interval` old.
pub fn spawn_scheduler(
    handle: OrchestratorHandle,
    store: Arc<dyn BuildStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let last = match store.last_checked_time().await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "Failed to read last check time");
                None
            }
        };
        let mut delay = next_check_delay(last, Utc::now(), interval);
        info!(
            interval_secs = interval.as_secs(),
            first_in_secs = delay.as_secs(),
            "Starting update check scheduler"
        );

        loop {
            tokio::time::sleep(delay).await;
            delay = interval;

            match handle.check().await {
                Ok(CheckOutcome::UpdateAvailable(build)) => {
                    info!(version = %build.version, "Scheduled check found an update")
                }
                Ok(CheckOutcome::NoUpdate) => debug!("Scheduled check found no update"),
                Err(UpdateError::Busy) => debug!("Skipping scheduled check, session active"),
                Err(UpdateError::Shutdown) => break,
                Err(e) => warn!(error = %e, "Scheduled check failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_check_delay() {
        let interval = Duration::from_secs(3600);
        let now = Utc::now();

        assert_eq!(next_check_delay(None, now, interval), Duration::ZERO);
        assert_eq!(
            next_check_delay(Some(now - chrono::Duration::minutes(20)), now, interval),
            Duration::from_secs(2400)
        );
        assert_eq!(
            next_check_delay(Some(now - chrono::Duration::hours(3)), now, interval),
            Duration::ZERO
        );
        // Clock went backwards.
        assert_eq!(
            next_check_delay(Some(now + chrono::Duration::minutes(5)), now, interval),
            interval
        );
    }
}
