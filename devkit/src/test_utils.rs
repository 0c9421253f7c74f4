/*!
Test harness for the gateway pipeline

Wires the real queue, worker pool, reconfiguration coordinator and publisher
to the devkit stubs:
- `MockFieldBus` for the devices
- `MockConnector` for the broker
- `MemoryStore` for persistence

Tests drive it through control messages and broker faults, then assert on
what reached the stub broker.
*/

use crate::field_stub::MockFieldBus;
use crate::fixtures::{ConfigBuilder, MemoryStore};
use crate::mqtt_stub::MockConnector;
use anyhow::Result;
use forgeedge_gateway::publisher::{ConnectionState, Publisher, PublisherSettings, PublisherStats};
use forgeedge_gateway::telemetry::{telemetry_topic, CONTROL_TOPIC};
use forgeedge_gateway::{GatewayConfig, PollSettings, ReconfigCoordinator, TelemetryQueue, WorkerPool};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEVKIT_SERIAL: &str = "devkit-serial";

/// Knobs for one harness run
#[derive(Debug, Clone, Copy)]
pub struct HarnessSettings {
    pub queue_capacity: usize,
    pub retry_interval: Duration,
    pub drain_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            retry_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_millis(500),
        }
    }
}

struct Running {
    handle: JoinHandle<ReconfigCoordinator>,
    stats: Arc<PublisherStats>,
    state: watch::Receiver<ConnectionState>,
    live: watch::Receiver<Arc<GatewayConfig>>,
}

pub struct TestHarness {
    pub bus: MockFieldBus,
    pub broker: MockConnector,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<TelemetryQueue>,
    settings: HarnessSettings,
    shutdown: CancellationToken,
    running: Option<Running>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_settings(HarnessSettings::default())
    }

    pub fn with_settings(settings: HarnessSettings) -> Result<Self> {
        env_logger::try_init().ok();

        Ok(Self {
            bus: MockFieldBus::new(),
            broker: MockConnector::new(),
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(TelemetryQueue::new(settings.queue_capacity)?),
            settings,
            shutdown: CancellationToken::new(),
            running: None,
        })
    }

    /// Activate `config` and spawn the publisher
    pub fn start(&mut self, config: &ConfigBuilder) -> Result<()> {
        if self.running.is_some() {
            anyhow::bail!("Harness already started");
        }

        let mut initial = config.build()?;
        initial.resolve_identity(DEVKIT_SERIAL);
        let mqtt = initial.mqtt.clone();

        let pool = WorkerPool::new(
            Arc::new(self.bus.clone()),
            self.queue.clone(),
            PollSettings {
                io_timeout: self.settings.io_timeout,
            },
        );
        let mut coordinator = ReconfigCoordinator::new(initial, pool, self.store.clone());
        coordinator.activate();
        let live = coordinator.subscribe();

        let publisher = Publisher::new(
            self.queue.clone(),
            Arc::new(self.broker.clone()),
            coordinator,
            mqtt,
            PublisherSettings {
                retry_interval: self.settings.retry_interval,
                drain_timeout: self.settings.drain_timeout,
            },
            self.shutdown.clone(),
        );
        let stats = publisher.stats();
        let state = publisher.watch_state();
        let handle = tokio::spawn(publisher.run());

        log::info!("🚀 Harness started");
        self.running = Some(Running {
            handle,
            stats,
            state,
            live,
        });
        Ok(())
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Harness not started"))
    }

    pub fn stats(&self) -> Result<Arc<PublisherStats>> {
        Ok(self.running()?.stats.clone())
    }

    pub fn state(&self) -> Result<ConnectionState> {
        Ok(*self.running()?.state.borrow())
    }

    /// The coordinator's live snapshot
    pub fn live_config(&self) -> Result<Arc<GatewayConfig>> {
        Ok(self.running()?.live.borrow().clone())
    }

    /// Publish a configuration document on the control topic
    pub fn send_config(&self, config: &ConfigBuilder) -> Result<()> {
        self.send_control(config.to_bytes()?)
    }

    pub fn send_control(&self, raw: Vec<u8>) -> Result<()> {
        self.broker.simulate_incoming(CONTROL_TOPIC, raw)
    }

    pub fn topic(&self, device_id: &str) -> Result<String> {
        Ok(telemetry_topic(&self.live_config()?.forge_edge_id, device_id))
    }

    /// Poll `condition` until it holds or `timeout_ms` elapses
    pub async fn wait_until<F>(&self, what: &str, timeout_ms: u64, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("⏰ Timeout waiting for {}", what);
        anyhow::bail!("Timed out after {}ms waiting for {}", timeout_ms, what)
    }

    /// Wait until at least `count` messages were published on `topic`
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout_ms: u64) -> Result<Vec<Value>> {
        let broker = self.broker.clone();
        self.wait_until(topic, timeout_ms, || broker.find_messages_by_topic(topic).len() >= count)
            .await?;
        self.broker.json_messages(topic)
    }

    pub async fn wait_for_state(&self, expected: ConnectionState, timeout_ms: u64) -> Result<()> {
        let mut state = self.running()?.state.clone();
        tokio::time::timeout(Duration::from_millis(timeout_ms), state.wait_for(|s| *s == expected))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for state {:?}", expected))??;
        Ok(())
    }

    /// Trigger shutdown and wait for the publisher to drain and exit
    pub async fn shutdown(&mut self) -> Result<ReconfigCoordinator> {
        let running = self
            .running
            .take()
            .ok_or_else(|| anyhow::anyhow!("Harness not started"))?;
        self.shutdown.cancel();

        let timeout = self.settings.drain_timeout + Duration::from_secs(2);
        let coordinator = tokio::time::timeout(timeout, running.handle).await??;
        log::info!("🛑 Harness stopped");
        Ok(coordinator)
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
