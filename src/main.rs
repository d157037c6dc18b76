use anyhow::Context;
use solarwatt_manager::config::ManagerConfig;
use solarwatt_manager::coordinator::Coordinator;
use solarwatt_manager::entities::{DeviceInfo, RefreshButton, SensorRegistry};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting SOLARWATT Manager bridge");

    let config = ManagerConfig::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    let coordinator = Coordinator::new(config).context("Cannot create SOLARWATT client")?;
    run(coordinator).await
}

async fn run(coordinator: Coordinator) -> anyhow::Result<()> {
    let host = coordinator.host().to_string();
    let device = DeviceInfo::new(&host, "");
    let sensors = Mutex::new(SensorRegistry::new(host.clone(), device.clone()));
    let button = RefreshButton::new(&host, device);

    coordinator.on_update(move |snapshot| {
        let mut sensors = sensors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for sensor in sensors.discover(snapshot) {
            info!(
                "New sensor {} ({}) enabled={}",
                sensor.name, sensor.unique_id, sensor.enabled_by_default
            );
        }
        info!(
            "Snapshot: {} items, {} stale",
            snapshot.len(),
            snapshot.stale_keys.len()
        );
    });

    // The first poll has to succeed, like a host would require before setting up entities
    coordinator
        .refresh()
        .await
        .with_context(|| format!("First poll of {host} failed"))?;
    button.press(&coordinator).await;

    let poll_loop = coordinator.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    warn!("Shutting down SOLARWATT Manager bridge");
    poll_loop.abort();
    Ok(())
}
