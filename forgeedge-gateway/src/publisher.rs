//! Publisher: the single consumer of the telemetry queue
//!
//! Owns the broker session and its connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |
//!                     v             | delivery failure / connection lost
//!              ReconnectPending     v
//!          (retry interval) -> Disconnected -> Connecting ...
//! ```
//!
//! An item whose delivery fails is kept in the publisher's in-flight slot and
//! delivered first after the next successful connect, so at most one item is
//! ever delivered twice. Control-topic messages are applied by the
//! `ControlHandler` one at a time, on this loop.
//!
//! Shutdown (the shutdown token fires) stops the workers through the handler,
//! stops the queue, and keeps delivering until the queue is drained or the
//! drain timeout expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::queue::{QueueError, QueueItem, TelemetryQueue};
use crate::reconfig::ControlHandler;
use crate::telemetry::CONTROL_TOPIC;
use crate::transport::{Connector, InboundMessage, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherSettings {
    /// Wait between a failed connect and the next attempt
    pub retry_interval: Duration,
    /// Upper bound on delivering what is left after shutdown
    pub drain_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Counters shared with whoever holds the `Arc`
#[derive(Debug, Default)]
pub struct PublisherStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    connects: AtomicU64,
    losses: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
}

impl PublisherStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Delivery attempts that did not complete
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn losses(&self) -> u64 {
        self.losses.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Items still undelivered when the drain timeout expired
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What woke the connected loop
enum Wake {
    Shutdown,
    DrainExpired,
    Inbound(Result<InboundMessage, TransportError>),
    Item(Result<QueueItem, QueueError>),
}

pub struct Publisher<H: ControlHandler> {
    queue: Arc<TelemetryQueue>,
    connector: Arc<dyn Connector>,
    control: H,
    mqtt: MqttConfig,
    settings: PublisherSettings,
    shutdown: CancellationToken,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    transport: Option<Box<dyn Transport>>,
    in_flight: Option<QueueItem>,
    drain_deadline: Option<Instant>,
    stats: Arc<PublisherStats>,
}

impl<H: ControlHandler> Publisher<H> {
    pub fn new(
        queue: Arc<TelemetryQueue>,
        connector: Arc<dyn Connector>,
        control: H,
        mqtt: MqttConfig,
        settings: PublisherSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            queue,
            connector,
            control,
            mqtt,
            settings,
            shutdown,
            state: ConnectionState::Disconnected,
            state_tx,
            transport: None,
            in_flight: None,
            drain_deadline: None,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    /// Run until the queue is drained after shutdown. Returns the control
    /// handler so the caller can inspect or reuse it.
    pub async fn run(mut self) -> H {
        info!("Publisher started, broker {}:{}", self.mqtt.broker, self.mqtt.port);

        loop {
            if self.shutdown.is_cancelled() && self.drain_deadline.is_none() {
                self.begin_drain().await;
            }

            if let Some(deadline) = self.drain_deadline {
                if self.in_flight.is_none() && self.queue.is_empty() {
                    info!("Telemetry queue drained");
                    break;
                }
                if Instant::now() >= deadline {
                    self.abandon();
                    break;
                }
            }

            match self.state {
                ConnectionState::Disconnected | ConnectionState::Connecting => self.connect().await,
                ConnectionState::ReconnectPending => self.wait_retry().await,
                ConnectionState::Connected => {
                    if let Some(item) = self.in_flight.take() {
                        self.deliver(item).await;
                        continue;
                    }

                    match self.next_wake().await {
                        Wake::Shutdown | Wake::DrainExpired => {}
                        Wake::Item(Ok(item)) => self.deliver(item).await,
                        Wake::Item(Err(_)) => {
                            info!("Telemetry queue stopped and empty");
                            break;
                        }
                        Wake::Inbound(Ok(message)) => self.handle_inbound(message).await,
                        Wake::Inbound(Err(e)) => self.connection_lost(e),
                    }
                }
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!(
            "Publisher stopped: {} delivered, {} failed attempts, {} connects, {} losses",
            self.stats.delivered(),
            self.stats.failed(),
            self.stats.connects(),
            self.stats.losses()
        );
        self.control
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("MQTT connection state: {:?} -> {:?}", self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    async fn begin_drain(&mut self) {
        info!("Shutdown requested, stopping poll workers");
        self.control.shutdown().await;
        self.queue.stop();
        self.drain_deadline = Some(Instant::now() + self.settings.drain_timeout);
        info!("Draining {} queued telemetry item(s)", self.queue.len());
    }

    fn abandon(&mut self) {
        let left = self.queue.len() + usize::from(self.in_flight.is_some());
        self.stats.abandoned.fetch_add(left as u64, Ordering::Relaxed);
        warn!("Drain timeout expired, {} telemetry item(s) not delivered", left);
    }

    async fn connect(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let attempt = open_session(self.connector.as_ref(), &self.mqtt);
        let result = match self.drain_deadline {
            Some(deadline) => timeout_at(deadline, attempt)
                .await
                .unwrap_or(Err(TransportError::Timeout(self.settings.drain_timeout))),
            None => attempt.await,
        };

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                PublisherStats::bump(&self.stats.connects);
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!("MQTT connect to {}:{} failed: {}", self.mqtt.broker, self.mqtt.port, e);
                self.set_state(ConnectionState::ReconnectPending);
            }
        }
    }

    async fn wait_retry(&mut self) {
        let mut until = Instant::now() + self.settings.retry_interval;
        if let Some(deadline) = self.drain_deadline {
            until = until.min(deadline);
        }
        debug!("Retrying MQTT connect in {:?}", until.saturating_duration_since(Instant::now()));

        let draining = self.drain_deadline.is_some();
        tokio::select! {
            _ = sleep_until(until) => {}
            _ = self.shutdown.cancelled(), if !draining => {}
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn next_wake(&mut self) -> Wake {
        let drain_deadline = self.drain_deadline;
        let Some(transport) = self.transport.as_mut() else {
            return Wake::Inbound(Err(TransportError::NotConnected));
        };
        let queue = &self.queue;
        let shutdown = &self.shutdown;

        tokio::select! {
            biased;
            _ = shutdown.cancelled(), if drain_deadline.is_none() => Wake::Shutdown,
            _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                Wake::DrainExpired
            }
            event = transport.next_event() => Wake::Inbound(event),
            item = queue.dequeue() => Wake::Item(item),
        }
    }

    async fn deliver(&mut self, item: QueueItem) {
        let Some(transport) = self.transport.as_mut() else {
            self.in_flight = Some(item);
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        match transport.publish(item.topic(), item.payload().as_bytes()).await {
            Ok(()) => {
                PublisherStats::bump(&self.stats.delivered);
                debug!("Delivered telemetry on {}", item.topic());
            }
            Err(e) => {
                PublisherStats::bump(&self.stats.failed);
                warn!("Delivery on {} failed, keeping it for retry: {}", item.topic(), e);
                self.in_flight = Some(item);
                self.connection_lost(e);
            }
        }
    }

    /// Drop the session without a clean disconnect; its event loop is gone
    fn connection_lost(&mut self, cause: TransportError) {
        PublisherStats::bump(&self.stats.losses);
        warn!("MQTT connection lost: {}", cause);
        self.transport = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        if message.topic != CONTROL_TOPIC {
            debug!("Ignoring message on {}", message.topic);
            return;
        }
        if self.drain_deadline.is_some() {
            info!("Ignoring configuration update received during shutdown");
            return;
        }

        info!("Configuration update received ({} bytes)", message.payload.len());
        match self.control.handle_control(&message.payload).await {
            Ok(report) => {
                PublisherStats::bump(&self.stats.applied);
                if let Some(mqtt) = report.transport {
                    info!("Broker settings changed, reconnecting to {}:{}", mqtt.broker, mqtt.port);
                    if let Some(mut transport) = self.transport.take() {
                        transport.disconnect().await;
                    }
                    self.mqtt = mqtt;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            Err(e) => {
                PublisherStats::bump(&self.stats.rejected);
                warn!("Configuration update rejected: {}", e);
            }
        }
    }
}

async fn open_session(connector: &dyn Connector, mqtt: &MqttConfig) -> Result<Box<dyn Transport>, TransportError> {
    let mut transport = connector.connect(mqtt).await?;
    transport.subscribe(CONTROL_TOPIC).await?;
    Ok(transport)
}
