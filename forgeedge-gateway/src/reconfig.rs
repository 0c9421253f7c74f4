//! Reconfiguration coordinator
//!
//! Owns the live configuration snapshot and the worker pool. A control
//! message is applied as:
//! 1. decode and validate (a rejected document changes nothing)
//! 2. persist the accepted document
//! 3. stop and join every running worker
//! 4. swap the live snapshot
//! 5. start one worker per device of the new snapshot
//!
//! Step 3 completing before step 4 is what lets a snapshot be dropped
//! safely: no worker is left holding the old one.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{self, ConfigError, GatewayConfig, MqttConfig};
use crate::pool::WorkerPool;
use crate::store::ConfigStore;

#[derive(Debug, Error)]
pub enum ReconfigError {
    #[error("configuration rejected: {0}")]
    Decode(#[from] ConfigError),
}

/// What an accepted control message changed.
///
/// Workers are already running on the new snapshot when this is returned.
/// A `transport` change is acted on afterwards by the publisher, which
/// closes its session and reconnects with the new settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub stopped: Vec<String>,
    pub started: Vec<String>,
    /// New broker settings, present only when they differ from the old ones
    pub transport: Option<MqttConfig>,
}

/// Receiver of control-topic payloads, driven by the publisher
#[async_trait]
pub trait ControlHandler: Send {
    async fn handle_control(&mut self, raw: &[u8]) -> Result<ApplyReport, ReconfigError>;

    /// Stop everything the handler runs. Called once, when draining begins.
    async fn shutdown(&mut self);
}

pub struct ReconfigCoordinator {
    live: watch::Sender<Arc<GatewayConfig>>,
    pool: WorkerPool,
    store: Arc<dyn ConfigStore>,
}

impl ReconfigCoordinator {
    pub fn new(initial: GatewayConfig, pool: WorkerPool, store: Arc<dyn ConfigStore>) -> Self {
        let (live, _) = watch::channel(Arc::new(initial));
        Self { live, pool, store }
    }

    /// Start workers for the current snapshot
    pub fn activate(&mut self) -> Vec<String> {
        let snapshot = self.live();
        info!(
            "Activating configuration for {} with {} device(s)",
            snapshot.forge_edge_id,
            snapshot.io_devices.len()
        );
        self.pool.start(&snapshot)
    }

    pub fn live(&self) -> Arc<GatewayConfig> {
        self.live.borrow().clone()
    }

    /// Observe snapshot swaps
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.live.subscribe()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn apply(&mut self, raw: &[u8]) -> Result<ApplyReport, ReconfigError> {
        let mut next = match config::decode(raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Rejected configuration update: {}", e);
                return Err(e.into());
            }
        };

        let current = self.live();
        let inherited = next.forge_edge_id.trim().is_empty();
        next.resolve_identity(&current.forge_edge_id);

        // A document without an id is stored with the inherited one so the
        // identity survives a restart.
        let stored = if inherited {
            match config::encode(&next) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("Cannot encode resolved configuration, storing it as received: {}", e);
                    raw.to_vec()
                }
            }
        } else {
            raw.to_vec()
        };
        if let Err(e) = self.store.persist(&stored).await {
            warn!("Accepted configuration could not be persisted: {}", e);
        }

        let transport = (next.mqtt != current.mqtt).then(|| next.mqtt.clone());
        log_device_diff(&current, &next);

        let stopped = self.pool.stop_all().await;
        let next = Arc::new(next);
        self.live.send_replace(next.clone());
        drop(current);
        let started = self.pool.start(&next);

        info!(
            "Configuration applied: {} worker(s) stopped, {} started{}",
            stopped.len(),
            started.len(),
            if transport.is_some() { ", broker settings changed" } else { "" }
        );

        Ok(ApplyReport {
            stopped,
            started,
            transport,
        })
    }
}

fn log_device_diff(current: &GatewayConfig, next: &GatewayConfig) {
    let old: BTreeSet<String> = current.device_ids().into_iter().collect();
    let new: BTreeSet<String> = next.device_ids().into_iter().collect();
    let removed: Vec<&String> = old.difference(&new).collect();
    let added: Vec<&String> = new.difference(&old).collect();
    if !removed.is_empty() || !added.is_empty() {
        info!("Device set change: removed {:?}, added {:?}", removed, added);
    }
}

#[async_trait]
impl ControlHandler for ReconfigCoordinator {
    async fn handle_control(&mut self, raw: &[u8]) -> Result<ApplyReport, ReconfigError> {
        self.apply(raw).await
    }

    async fn shutdown(&mut self) {
        self.pool.stop_all().await;
    }
}
