//! ForgeEdge gateway binary
//!
//! Startup: settings from the environment, identity from the serial file,
//! configuration from the store. Runs until SIGINT/SIGTERM, then stops the
//! poll workers, the queue and finally the publisher, in that order.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forgeedge_gateway::field::ModbusTcpBus;
use forgeedge_gateway::store::{load_serial, load_startup_config};
use forgeedge_gateway::transport::MqttConnector;
use forgeedge_gateway::{
    FileConfigStore, PollSettings, Publisher, PublisherSettings, ReconfigCoordinator, RuntimeSettings,
    TelemetryQueue, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forgeedge_gateway=info")),
        )
        .init();

    info!("🏭 ForgeEdge gateway starting...");

    let settings = RuntimeSettings::from_env();
    let serial = load_serial(&settings.serial_path).await;
    let store = Arc::new(FileConfigStore::new(settings.config_path.clone()));
    let config = load_startup_config(store.as_ref(), serial.as_deref()).await;
    info!(
        "Gateway {} with {} device(s), broker {}:{}",
        config.forge_edge_id,
        config.io_devices.len(),
        config.mqtt.broker,
        config.mqtt.port
    );

    let queue = Arc::new(
        TelemetryQueue::new(settings.queue_capacity).context("Failed to create telemetry queue")?,
    );

    let pool = WorkerPool::new(
        Arc::new(ModbusTcpBus::new()),
        queue.clone(),
        PollSettings {
            io_timeout: settings.io_timeout,
        },
    );
    let mqtt = config.mqtt.clone();
    let mut coordinator = ReconfigCoordinator::new(config, pool, store);
    coordinator.activate();

    let shutdown = CancellationToken::new();
    let publisher = Publisher::new(
        queue,
        Arc::new(MqttConnector::default()),
        coordinator,
        mqtt,
        PublisherSettings {
            retry_interval: settings.retry_interval,
            drain_timeout: settings.drain_timeout,
        },
        shutdown.clone(),
    );
    let stats = publisher.stats();
    let publisher = tokio::spawn(publisher.run());

    wait_for_signal().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    publisher.await.context("Publisher task failed")?;
    info!(
        "ForgeEdge gateway stopped ({} delivered, {} abandoned)",
        stats.delivered(),
        stats.abandoned()
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")
}
