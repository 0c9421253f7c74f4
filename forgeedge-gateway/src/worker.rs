//! Per-device poll worker
//!
//! One worker owns one device's field connection for the lifetime of a
//! configuration snapshot. Each cycle it reads every parameter in order,
//! builds one telemetry record and hands it to the queue.
//!
//! Read failures never end the worker: a failed parameter is published
//! without a value, and a failure that leaves the link unusable closes the
//! connection so the next cycle reconnects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, GatewayConfig};
use crate::field::{FieldBus, FieldConnection, FieldError};
use crate::queue::TelemetryQueue;
use crate::telemetry::{DataEntry, TelemetryRecord};

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Bound on a single connect or read request
    pub io_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_millis(3000),
        }
    }
}

pub struct PollWorker {
    snapshot: Arc<GatewayConfig>,
    index: usize,
    bus: Arc<dyn FieldBus>,
    queue: Arc<TelemetryQueue>,
    stop: CancellationToken,
    settings: PollSettings,
}

/// Outcome of one poll cycle
struct Cycle {
    record: TelemetryRecord,
    link_broken: bool,
}

impl PollWorker {
    /// `index` selects the device inside `snapshot`; the snapshot stays
    /// alive for as long as the worker holds it.
    pub fn new(
        snapshot: Arc<GatewayConfig>,
        index: usize,
        bus: Arc<dyn FieldBus>,
        queue: Arc<TelemetryQueue>,
        stop: CancellationToken,
        settings: PollSettings,
    ) -> Self {
        Self {
            snapshot,
            index,
            bus,
            queue,
            stop,
            settings,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.snapshot.io_devices[self.index]
    }

    pub async fn run(self) {
        let device = self.device();
        let device_id = device.io_device_id.clone();
        let endpoint = device.endpoint();
        let interval = device.poll_interval();
        let mut connection: Option<Box<dyn FieldConnection>> = None;

        info!("Poll worker started for {} at {}", device_id, endpoint);

        while !self.stop.is_cancelled() {
            if connection.is_none() {
                match self.stoppable(self.bounded(self.bus.connect(&endpoint))).await {
                    None => break,
                    Some(Ok(conn)) => {
                        info!("Connected to device {} at {}", device_id, endpoint);
                        connection = Some(conn);
                    }
                    Some(Err(e)) => {
                        warn!("Device {} unreachable at {}: {}", device_id, endpoint, e);
                        if self.stoppable(sleep(interval)).await.is_none() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(conn) = connection.as_mut() else {
                continue;
            };

            let cycle = match self.stoppable(self.poll_cycle(&mut **conn)).await {
                Some(cycle) => cycle,
                None => break,
            };

            if cycle.link_broken {
                if let Some(mut conn) = connection.take() {
                    conn.close().await;
                }
                debug!("Dropped connection to {}, reconnecting next cycle", device_id);
            }

            match cycle.record.into_queue_item() {
                Ok(item) => match self.stoppable(self.queue.enqueue(item)).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        debug!("Worker {} exiting: {}", device_id, e);
                        break;
                    }
                    None => break,
                },
                Err(e) => warn!("Failed to encode telemetry for {}: {}", device_id, e),
            }

            if self.stoppable(sleep(interval)).await.is_none() {
                break;
            }
        }

        if let Some(mut conn) = connection.take() {
            conn.close().await;
        }
        info!("Poll worker stopped for {}", device_id);
    }

    async fn poll_cycle(&self, conn: &mut dyn FieldConnection) -> Cycle {
        let device = self.device();
        let mut link_broken = false;
        let mut record = TelemetryRecord::new(
            &self.snapshot.forge_edge_id,
            &device.io_device_id,
            chrono::Utc::now().timestamp(),
        );

        for param in &device.parameters {
            let Some(kind) = param.kind.register_kind() else {
                debug!("Skipping parameter {} of unsupported type {:?}", param.name, param.kind);
                continue;
            };

            let count = param.effective_count(kind);
            match self.bounded(conn.read(kind, param.address, count)).await {
                Ok(values) => {
                    record.push(DataEntry::from_values(param, kind, values, self.snapshot.data_mode));
                }
                Err(e) => {
                    warn!(
                        "Read of {} ({} @ {}) on {} failed: {}",
                        param.name, kind, param.address, device.io_device_id, e
                    );
                    link_broken |= e.breaks_connection();
                    record.push(DataEntry::missing(&param.name, kind));
                }
            }
        }

        Cycle { record, link_broken }
    }

    /// Apply the I/O timeout to a field request
    async fn bounded<T>(&self, request: impl Future<Output = Result<T, FieldError>>) -> Result<T, FieldError> {
        match timeout(self.settings.io_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FieldError::Timeout(self.settings.io_timeout)),
        }
    }

    /// Run `fut` unless the stop token fires first
    async fn stoppable<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            _ = self.stop.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterConfig, ParameterKind};
    use crate::field::{DeviceEndpoint, ReadValues, RegisterKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedBus {
        registers: Vec<u16>,
        fail_reads: bool,
        hang_reads: bool,
        connects: Arc<Mutex<usize>>,
    }

    struct ScriptedConnection {
        registers: Vec<u16>,
        fail_reads: bool,
        hang_reads: bool,
    }

    #[async_trait]
    impl FieldBus for ScriptedBus {
        async fn connect(&self, _endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, FieldError> {
            *self.connects.lock().unwrap() += 1;
            Ok(Box::new(ScriptedConnection {
                registers: self.registers.clone(),
                fail_reads: self.fail_reads,
                hang_reads: self.hang_reads,
            }))
        }
    }

    #[async_trait]
    impl FieldConnection for ScriptedConnection {
        async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<ReadValues, FieldError> {
            if self.hang_reads {
                std::future::pending::<()>().await;
            }
            if self.fail_reads {
                return Err(FieldError::Io(std::io::ErrorKind::ConnectionReset.into()));
            }
            let start = address as usize;
            let regs = self.registers[start..start + count as usize].to_vec();
            Ok(match kind {
                RegisterKind::Coil | RegisterKind::DiscreteInput => {
                    ReadValues::Bits(regs.into_iter().map(|r| r != 0).collect())
                }
                _ => ReadValues::Registers(regs),
            })
        }

        async fn close(&mut self) {}
    }

    fn snapshot(params: Vec<ParameterConfig>) -> Arc<GatewayConfig> {
        snapshot_every(params, 10)
    }

    fn snapshot_every(params: Vec<ParameterConfig>, poll_interval_ms: u64) -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::default();
        config.forge_edge_id = "edge-01".into();
        config.io_devices.push(DeviceConfig {
            io_device_id: "tank1".into(),
            ip: "127.0.0.1".into(),
            port: 502,
            unit_id: 1,
            poll_interval_ms,
            parameters: params,
        });
        Arc::new(config)
    }

    fn param(name: &str, kind: &str, address: u16) -> ParameterConfig {
        ParameterConfig {
            name: name.into(),
            kind: ParameterKind::parse(kind),
            address,
            count: 1,
            scale: 0.1,
        }
    }

    #[tokio::test]
    async fn test_worker_publishes_scaled_record() {
        let connects = Arc::new(Mutex::new(0));
        let bus = Arc::new(ScriptedBus {
            registers: vec![0, 250, 1],
            fail_reads: false,
            hang_reads: false,
            connects: connects.clone(),
        });
        let queue = Arc::new(TelemetryQueue::new(4).unwrap());
        let stop = CancellationToken::new();
        let worker = PollWorker::new(
            snapshot(vec![param("level", "holding", 1), param("mystery", "weird", 0)]),
            0,
            bus,
            queue.clone(),
            stop.clone(),
            PollSettings::default(),
        );
        let handle = tokio::spawn(worker.run());

        let item = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap().unwrap();
        stop.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert_eq!(item.topic(), "forgeedge/edge-01/tank1/data");
        let json: serde_json::Value = serde_json::from_str(item.payload()).unwrap();
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["name"], "level");
        assert!((data[0]["value"].as_f64().unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(*connects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_reads_reconnect_every_cycle() {
        let connects = Arc::new(Mutex::new(0));
        let bus = Arc::new(ScriptedBus {
            registers: vec![],
            fail_reads: true,
            hang_reads: false,
            connects: connects.clone(),
        });
        let queue = Arc::new(TelemetryQueue::new(8).unwrap());
        let stop = CancellationToken::new();
        let worker = PollWorker::new(
            snapshot(vec![param("level", "holding", 0)]),
            0,
            bus,
            queue.clone(),
            stop.clone(),
            PollSettings::default(),
        );
        let handle = tokio::spawn(worker.run());

        for _ in 0..2 {
            let item = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap().unwrap();
            let json: serde_json::Value = serde_json::from_str(item.payload()).unwrap();
            assert_eq!(json["data"][0], serde_json::json!({ "name": "level", "type": "holding" }));
        }
        stop.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert!(*connects.lock().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_stops() {
        let bus = Arc::new(ScriptedBus {
            registers: vec![1],
            fail_reads: false,
            hang_reads: false,
            connects: Arc::new(Mutex::new(0)),
        });
        let queue = Arc::new(TelemetryQueue::new(1).unwrap());
        queue.stop();
        let worker = PollWorker::new(
            snapshot(vec![param("level", "holding", 0)]),
            0,
            bus,
            queue,
            CancellationToken::new(),
            PollSettings::default(),
        );

        timeout(Duration::from_secs(1), worker.run()).await.unwrap();
    }

    #[tokio::test]
    async fn test_hung_read_times_out_and_reconnects() {
        let connects = Arc::new(Mutex::new(0));
        let bus = Arc::new(ScriptedBus {
            registers: vec![0],
            fail_reads: false,
            hang_reads: true,
            connects: connects.clone(),
        });
        let queue = Arc::new(TelemetryQueue::new(8).unwrap());
        let stop = CancellationToken::new();
        let worker = PollWorker::new(
            snapshot(vec![param("level", "holding", 0)]),
            0,
            bus,
            queue.clone(),
            stop.clone(),
            PollSettings {
                io_timeout: Duration::from_millis(30),
            },
        );
        let handle = tokio::spawn(worker.run());

        for _ in 0..2 {
            let item = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap().unwrap();
            let json: serde_json::Value = serde_json::from_str(item.payload()).unwrap();
            assert_eq!(json["data"][0], serde_json::json!({ "name": "level", "type": "holding" }));
        }
        stop.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert!(*connects.lock().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_hung_read() {
        let connects = Arc::new(Mutex::new(0));
        let bus = Arc::new(ScriptedBus {
            registers: vec![0],
            fail_reads: false,
            hang_reads: true,
            connects: connects.clone(),
        });
        let queue = Arc::new(TelemetryQueue::new(1).unwrap());
        let stop = CancellationToken::new();
        let worker = PollWorker::new(
            snapshot_every(vec![param("level", "holding", 0)], 10_000),
            0,
            bus,
            queue.clone(),
            stop.clone(),
            PollSettings {
                io_timeout: Duration::from_secs(60),
            },
        );
        let handle = tokio::spawn(worker.run());

        // Connected, so the worker is now parked inside the read
        while *connects.lock().unwrap() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(20)).await;

        let started = tokio::time::Instant::now();
        stop.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(queue.is_empty());
    }
}
