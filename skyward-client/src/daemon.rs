//! Daemon wiring: builds the collaborators from the configuration and runs
//! the orchestrator until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use skyward_engine::{
    probe_kind, AOnlyEngine, AbEngine, ApplyMode, BootctlControl, ClientMechanism, EngineKind,
    FileRecoveryControl, MockBootControl, MockMechanism, Slot, UpdateEngine,
};
use skyward_power::{BatterySource, ManualBattery, PowerGate, SysfsBattery};

use crate::config::{BatterySourceConfig, Config, EngineKindConfig};
use crate::update::{
    spawn_scheduler, BuildStore, CheckOutcome, DownloadEngine, JsonFileStore, ManifestClient,
    Orchestrator, OrchestratorDeps, OrchestratorSettings, StatusEvent,
};

/// Pick and build the update engine. The choice holds for the process
/// lifetime.
pub async fn build_engine(config: &Config) -> Arc<dyn UpdateEngine> {
    let engine = &config.engine;
    let kind = match engine.kind {
        EngineKindConfig::Mock => {
            info!("Using mock update engine");
            return Arc::new(AbEngine::new(
                Arc::new(MockMechanism::succeeding()),
                Arc::new(MockBootControl::new(Slot::A)),
            ));
        }
        EngineKindConfig::Auto => {
            let kind = probe_kind(&config.device.build_prop, &engine.slot_suffix_file).await;
            info!(kind = %kind, "Probed update engine");
            kind
        }
        EngineKindConfig::Ab => EngineKind::AB,
        EngineKindConfig::AOnly => EngineKind::AOnly,
    };

    match kind {
        EngineKind::AB => {
            let mode = if engine.streaming {
                ApplyMode::Streaming
            } else {
                ApplyMode::BlockBased
            };
            info!(client = %engine.client_binary.display(), mode = ?mode, "Using A/B update engine");
            Arc::new(
                AbEngine::new(
                    Arc::new(ClientMechanism::new(&engine.client_binary)),
                    Arc::new(BootctlControl::new(
                        &engine.slot_suffix_file,
                        &engine.bootctl_binary,
                    )),
                )
                .with_mode(mode),
            )
        }
        EngineKind::AOnly => {
            info!(command_file = %engine.command_file.display(), "Using A-only update engine");
            Arc::new(AOnlyEngine::new(Arc::new(FileRecoveryControl::new(
                engine.recovery_paths(),
            ))))
        }
    }
}

fn build_battery(config: &Config) -> Arc<dyn BatterySource> {
    match config.power.source {
        BatterySourceConfig::Sysfs => {
            info!(dir = %config.power.supply_dir.display(), "Reading battery from sysfs");
            Arc::new(SysfsBattery::new(&config.power.supply_dir))
        }
        BatterySourceConfig::Manual => {
            info!("Using manual battery source");
            Arc::new(ManualBattery::new(100, true))
        }
    }
}

/// Log every status event.
fn spawn_status_logger(mut events: broadcast::Receiver<StatusEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    session = %event.session,
                    seq = event.seq,
                    status = ?event.status,
                    "Update status"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status logger lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub async fn run(config: Config, check_only: bool) -> Result<()> {
    let updates = &config.updates;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(updates.connect_timeout_secs))
        .user_agent(concat!("skyward-updater/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let engine = build_engine(&config).await;

    let gate = Arc::new(PowerGate::new(build_battery(&config), config.power.policy()));
    gate.refresh().await;
    let monitor = gate.spawn_monitor(Duration::from_secs(config.power.poll_interval_secs));

    let store: Arc<dyn BuildStore> = Arc::new(JsonFileStore::new(&updates.state_dir));
    let manifest = Arc::new(ManifestClient::new(
        http.clone(),
        updates.manifest_url.clone(),
        updates.retry,
        Duration::from_millis(updates.reachability_timeout_ms),
    ));
    let downloader = Arc::new(DownloadEngine::new(http, updates.retry));

    let deps = OrchestratorDeps {
        manifest,
        engine,
        gate,
        store: Arc::clone(&store),
        downloader,
    };
    let settings = OrchestratorSettings {
        download_dir: updates.download_dir.clone(),
        state_dir: updates.state_dir.clone(),
        build_prop: config.device.build_prop.clone(),
        auto_download: updates.auto_download && !check_only,
        auto_apply: updates.auto_apply,
        persist_every_bytes: updates.persist_every_bytes,
    };

    let (handle, orchestrator) = Orchestrator::spawn(deps, settings);
    let logger = spawn_status_logger(handle.subscribe());

    if check_only {
        let outcome = handle.check().await;
        drop(handle);
        monitor.abort();
        let _ = orchestrator.await;
        logger.abort();
        return match outcome {
            Ok(CheckOutcome::UpdateAvailable(build)) => {
                info!(version = %build.version, size = build.file_size, "Update available");
                Ok(())
            }
            Ok(CheckOutcome::NoUpdate) => {
                info!("No update available");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Update check failed")),
        };
    }

    let scheduler = spawn_scheduler(
        handle.clone(),
        store,
        updates.check_interval_duration(),
    );

    info!(
        manifest = %updates.manifest_url,
        interval = %updates.check_interval,
        "Update daemon running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    scheduler.abort();
    monitor.abort();
    drop(handle);
    if tokio::time::timeout(Duration::from_secs(5), orchestrator)
        .await
        .is_err()
    {
        error!("Orchestrator did not stop in time");
    }
    logger.abort();

    Ok(())
}
