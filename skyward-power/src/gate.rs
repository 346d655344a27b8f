//! The battery gate.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PowerError;
use crate::policy::PowerPolicy;
use crate::source::{BatteryReading, BatterySource};

/// Combines a [`BatterySource`] with a [`PowerPolicy`].
///
/// The start and continue decisions are published on `watch` channels so
/// that the orchestrator can react to changes without polling. Both signals
/// start out `true` and are corrected by the first [`PowerGate::refresh`].
pub struct PowerGate {
    source: Arc<dyn BatterySource>,
    policy: PowerPolicy,
    signal: watch::Sender<bool>,
    start_signal: watch::Sender<bool>,
    last: Mutex<Option<BatteryReading>>,
}

fn publish(signal: &watch::Sender<bool>, allowed: bool) -> bool {
    signal.send_if_modified(|current| {
        if *current != allowed {
            *current = allowed;
            true
        } else {
            false
        }
    })
}

impl PowerGate {
    pub fn new(source: Arc<dyn BatterySource>, policy: PowerPolicy) -> Self {
        let (signal, _rx) = watch::channel(true);
        let (start_signal, _rx) = watch::channel(true);
        Self {
            source,
            policy,
            signal,
            start_signal,
            last: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> PowerPolicy {
        self.policy
    }

    /// Current reading. Devices without a battery read as mains powered;
    /// any other read failure yields `None`.
    pub async fn reading(&self) -> Option<BatteryReading> {
        let reading = match self.source.read().await {
            Ok(reading) => reading,
            Err(PowerError::NoBattery(dir)) => {
                debug!(dir = %dir, "No battery present, assuming mains power");
                BatteryReading::mains()
            }
            Err(e) => {
                warn!(error = %e, "Failed to read battery");
                return None;
            }
        };
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(reading);
        Some(reading)
    }

    /// Last reading taken by any gate call.
    pub fn last_reading(&self) -> Option<BatteryReading> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether a download or apply may start now. Unreadable batteries deny.
    pub async fn can_start(&self) -> bool {
        let allowed = match self.reading().await {
            Some(reading) => {
                let allowed = self.policy.can_start(reading);
                debug!(level = reading.level, charging = reading.charging, allowed, "Start check");
                allowed
            }
            None => false,
        };
        publish(&self.start_signal, allowed);
        allowed
    }

    /// Whether an in-progress download or apply may continue. Also updates
    /// the published signal.
    pub async fn can_continue(&self) -> bool {
        self.refresh().await
    }

    /// Subscribe to the continue signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Subscribe to the start signal.
    pub fn subscribe_start(&self) -> watch::Receiver<bool> {
        self.start_signal.subscribe()
    }

    /// Last published continue decision.
    pub fn is_allowed(&self) -> bool {
        *self.signal.borrow()
    }

    /// Re-read the battery and publish both decisions. Returns the continue
    /// decision.
    pub async fn refresh(&self) -> bool {
        let reading = self.reading().await;
        let allowed = reading.map_or(false, |r| self.policy.can_continue(r));
        let start_allowed = reading.map_or(false, |r| self.policy.can_start(r));

        if publish(&self.start_signal, start_allowed) {
            debug!(allowed = start_allowed, "Start gate changed");
        }
        if publish(&self.signal, allowed) {
            let reading = self.last_reading();
            info!(
                allowed,
                level = reading.map(|r| r.level),
                charging = reading.map(|r| r.charging),
                "Power gate changed"
            );
        }
        allowed
    }

    /// Refresh on every `interval` tick and on every push notification from
    /// the source.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut changes = gate.source.changes();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = async {
                        match changes.as_mut() {
                            Some(rx) => rx.changed().await.is_ok(),
                            None => std::future::pending::<bool>().await,
                        }
                    } => {
                        if !changed {
                            debug!("Battery source stopped pushing changes");
                            changes = None;
                        }
                    }
                }
                gate.refresh().await;
            }
        })
    }
}
