/*!
Configuration document builders and an in-memory store

Builders emit the JSON document exactly as it travels on the control topic,
so tests exercise the real decoder.
*/

use anyhow::Result;
use async_trait::async_trait;
use forgeedge_gateway::config::{self, GatewayConfig};
use forgeedge_gateway::store::{ConfigStore, StoreError};
use serde_json::{json, Value};
use std::sync::Mutex;

/// Builds a configuration document
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    doc: Value,
}

/// Builds one `io_devices` entry
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    device: Value,
}

impl ConfigBuilder {
    pub fn new(edge_id: &str) -> Self {
        Self {
            doc: json!({
                "forge_edge_id": edge_id,
                "data_mode": "processed",
                "mqtt": { "broker": "broker.local", "port": 1883 },
                "io_devices": []
            }),
        }
    }

    pub fn data_mode(mut self, mode: &str) -> Self {
        self.doc["data_mode"] = json!(mode);
        self
    }

    pub fn broker(mut self, host: &str, port: u16) -> Self {
        self.doc["mqtt"]["broker"] = json!(host);
        self.doc["mqtt"]["port"] = json!(port);
        self
    }

    pub fn device(mut self, device: DeviceBuilder) -> Self {
        if let Some(devices) = self.doc["io_devices"].as_array_mut() {
            devices.push(device.device);
        }
        self
    }

    /// Remove a top-level field, e.g. to test identity inheritance
    pub fn without(mut self, field: &str) -> Self {
        if let Some(obj) = self.doc.as_object_mut() {
            obj.remove(field);
        }
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.doc)?)
    }

    /// Decode through the gateway's own codec
    pub fn build(&self) -> Result<GatewayConfig> {
        Ok(config::decode(&self.to_bytes()?)?)
    }
}

impl DeviceBuilder {
    pub fn new(id: &str, ip: &str) -> Self {
        Self {
            device: json!({
                "io_device_id": id,
                "ip": ip,
                "port": 502,
                "unit_id": 1,
                "poll_interval_ms": 20,
                "parameters": []
            }),
        }
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.device["poll_interval_ms"] = json!(ms);
        self
    }

    pub fn parameter(mut self, name: &str, kind: &str, address: u16, count: u16, scale: f64) -> Self {
        if let Some(params) = self.device["parameters"].as_array_mut() {
            params.push(json!({
                "name": name,
                "type": kind,
                "address": address,
                "count": count,
                "scale": scale
            }));
        }
        self
    }
}

/// `ConfigStore` kept in memory, recording every write
#[derive(Default)]
pub struct MemoryStore {
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(raw: Vec<u8>) -> Self {
        let store = Self::default();
        store.writes.lock().unwrap().push(raw);
        store
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn last_json(&self) -> Option<Value> {
        let writes = self.writes.lock().unwrap();
        writes.last().and_then(|raw| serde_json::from_slice(raw).ok())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn persist(&self, raw: &[u8]) -> Result<(), StoreError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(StoreError::Io(std::io::ErrorKind::PermissionDenied.into()));
        }
        self.writes.lock().unwrap().push(raw.to_vec());
        Ok(())
    }

    async fn load_persisted(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.writes.lock().unwrap().last().cloned())
    }
}
