//! Registry of running poll workers, keyed by device id
//!
//! The pool is owned by the reconfiguration coordinator. It starts one worker
//! per device of a snapshot and stops them all before the next snapshot is
//! activated, so no worker ever outlives the snapshot it reads.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::GatewayConfig;
use crate::field::FieldBus;
use crate::queue::TelemetryQueue;
use crate::worker::{PollSettings, PollWorker};

struct WorkerHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

pub struct WorkerPool {
    bus: Arc<dyn FieldBus>,
    queue: Arc<TelemetryQueue>,
    settings: PollSettings,
    workers: HashMap<String, WorkerHandle>,
}

impl WorkerPool {
    pub fn new(bus: Arc<dyn FieldBus>, queue: Arc<TelemetryQueue>, settings: PollSettings) -> Self {
        Self {
            bus,
            queue,
            settings,
            workers: HashMap::new(),
        }
    }

    /// Spawn one worker per device in `snapshot`. Returns the started ids,
    /// sorted. A device id already present in the pool is left untouched.
    pub fn start(&mut self, snapshot: &Arc<GatewayConfig>) -> Vec<String> {
        let mut started = Vec::new();

        for (index, device) in snapshot.io_devices.iter().enumerate() {
            let id = device.io_device_id.clone();
            if self.workers.contains_key(&id) {
                debug!("Worker for {} already running", id);
                continue;
            }

            let stop = CancellationToken::new();
            let worker = PollWorker::new(
                snapshot.clone(),
                index,
                self.bus.clone(),
                self.queue.clone(),
                stop.clone(),
                self.settings,
            );
            let join = tokio::spawn(worker.run());
            self.workers.insert(id.clone(), WorkerHandle { stop, join });
            started.push(id);
        }

        started.sort();
        if !started.is_empty() {
            info!("Started {} poll worker(s): {:?}", started.len(), started);
        }
        started
    }

    /// Signal every worker, then wait for all of them to finish.
    ///
    /// Workers exit at their next suspension point, so this returns within
    /// about one I/O timeout. Returns the stopped ids, sorted.
    pub async fn stop_all(&mut self) -> Vec<String> {
        for handle in self.workers.values() {
            handle.stop.cancel();
        }

        let mut stopped = Vec::with_capacity(self.workers.len());
        for (id, handle) in self.workers.drain() {
            if let Err(e) = handle.join.await {
                error!("Poll worker {} ended abnormally: {}", id, e);
            }
            stopped.push(id);
        }

        stopped.sort();
        if !stopped.is_empty() {
            info!("Stopped {} poll worker(s): {:?}", stopped.len(), stopped);
        }
        stopped
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.values() {
            handle.stop.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::field::{DeviceEndpoint, FieldConnection, FieldError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnreachableBus;

    #[async_trait]
    impl FieldBus for UnreachableBus {
        async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, FieldError> {
            Err(FieldError::Resolve(endpoint.to_string()))
        }
    }

    fn snapshot(ids: &[&str]) -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::default();
        for id in ids {
            config.io_devices.push(DeviceConfig {
                io_device_id: id.to_string(),
                ip: "10.0.0.1".into(),
                port: 502,
                unit_id: 1,
                poll_interval_ms: 1000,
                parameters: vec![],
            });
        }
        Arc::new(config)
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(
            Arc::new(UnreachableBus),
            Arc::new(TelemetryQueue::new(4).unwrap()),
            PollSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let mut pool = pool();
        let started = pool.start(&snapshot(&["b", "a"]));
        assert_eq!(started, vec!["a", "b"]);
        assert_eq!(pool.device_ids(), vec!["a", "b"]);

        // Workers are sleeping out their poll interval; stop must not wait for it
        let stopped = tokio::time::timeout(Duration::from_millis(500), pool.stop_all())
            .await
            .unwrap();
        assert_eq!(stopped, vec!["a", "b"]);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_start_skips_running_ids() {
        let mut pool = pool();
        pool.start(&snapshot(&["a"]));
        let started = pool.start(&snapshot(&["a", "c"]));
        assert_eq!(started, vec!["c"]);
        assert_eq!(pool.len(), 2);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_empty_snapshot_starts_nothing() {
        let mut pool = pool();
        assert!(pool.start(&snapshot(&[])).is_empty());
        assert!(pool.stop_all().await.is_empty());
    }
}
