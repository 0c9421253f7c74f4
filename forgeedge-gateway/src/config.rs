//! Gateway configuration document
//!
//! Handles:
//! - Decoding/encoding of the JSON configuration document
//! - Defaults for missing numeric fields (port, poll interval, count, scale)
//! - Validation of device identities and transport security
//! - Runtime settings taken from the process environment

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::field::{DeviceEndpoint, RegisterKind};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/forgeedge/config.json";
pub const SERIAL_FILE_PATH: &str = "/etc/forgeedge/serial.txt";
pub const UNKNOWN_EDGE_ID: &str = "forgeedge-unknown";

const DEFAULT_MODBUS_PORT: u16 = 502;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u16 = 30;

/// Errors raised while decoding or validating a configuration document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether numeric register values are published scaled or as read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    #[default]
    Processed,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    None,
    Tls,
}

/// Top-level configuration snapshot.
///
/// A snapshot is never mutated once activated; reconfiguration builds a new
/// one and retires the old after every worker reading it has been joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(alias = "edge_id", default)]
    pub forge_edge_id: String,
    #[serde(default)]
    pub data_mode: DataMode,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub io_devices: Vec<DeviceConfig>,
}

/// Broker connection settings. Two configurations with different
/// `MqttConfig` values target different transport endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub security_mode: SecurityMode,
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub tls: TlsConfig,
}

/// Paths to PEM material used when `security_mode` is `tls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub verify_peer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub io_device_id: String,
    #[serde(alias = "host")]
    pub ip: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default)]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

/// Parameter type as written in the document. Unrecognised names are kept
/// so the document round-trips, and skipped while polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterKind {
    Known(RegisterKind),
    Unknown(String),
}

fn default_modbus_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            forge_edge_id: String::new(),
            data_mode: DataMode::Processed,
            mqtt: MqttConfig::default(),
            io_devices: Vec::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::None,
            broker: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
            verify_peer: true,
        }
    }
}

impl Default for ParameterKind {
    fn default() -> Self {
        ParameterKind::Known(RegisterKind::HoldingRegister)
    }
}

impl ParameterKind {
    /// Parse a document type name, accepting the short and long spellings
    pub fn parse(name: &str) -> Self {
        let kind = match name.trim().to_ascii_lowercase().as_str() {
            "coil" | "coils" => Some(RegisterKind::Coil),
            "discrete" | "discrete_input" | "discrete_inputs" => Some(RegisterKind::DiscreteInput),
            "holding" | "holding_register" | "holding_registers" => {
                Some(RegisterKind::HoldingRegister)
            }
            "input" | "input_register" | "input_registers" => Some(RegisterKind::InputRegister),
            _ => None,
        };

        match kind {
            Some(kind) => ParameterKind::Known(kind),
            None => ParameterKind::Unknown(name.to_string()),
        }
    }

    pub fn register_kind(&self) -> Option<RegisterKind> {
        match self {
            ParameterKind::Known(kind) => Some(*kind),
            ParameterKind::Unknown(_) => None,
        }
    }
}

impl Serialize for ParameterKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParameterKind::Known(kind) => serializer.serialize_str(kind.as_str()),
            ParameterKind::Unknown(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for ParameterKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ParameterKind::parse(&name))
    }
}

impl ParameterConfig {
    /// Element count actually requested from the device: at least one and
    /// never more than the read primitive allows for `kind`.
    pub fn effective_count(&self, kind: RegisterKind) -> u16 {
        self.count.clamp(1, kind.max_count())
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            host: self.ip.clone(),
            port: self.port,
            unit_id: self.unit_id,
        }
    }
}

impl GatewayConfig {
    /// Fill identity fields left empty by the document.
    ///
    /// The gateway id falls back to `fallback_id`, the MQTT client id to
    /// `forgeedge-<gateway id>`.
    pub fn resolve_identity(&mut self, fallback_id: &str) {
        if self.forge_edge_id.trim().is_empty() {
            self.forge_edge_id = fallback_id.to_string();
        }
        if self.mqtt.client_id.trim().is_empty() {
            self.mqtt.client_id = format!("forgeedge-{}", self.forge_edge_id);
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.io_devices.iter().map(|d| d.io_device_id.clone()).collect()
    }

    /// Replace zero values that the document format treats as "unset"
    fn normalize(&mut self) {
        if self.mqtt.port == 0 {
            self.mqtt.port = DEFAULT_MQTT_PORT;
        }
        if self.mqtt.keep_alive_secs == 0 {
            self.mqtt.keep_alive_secs = DEFAULT_KEEP_ALIVE_SECS;
        }

        for device in &mut self.io_devices {
            if device.port == 0 {
                device.port = DEFAULT_MODBUS_PORT;
            }
            if device.poll_interval_ms == 0 {
                device.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
            }
            for (idx, param) in device.parameters.iter_mut().enumerate() {
                if param.count == 0 {
                    param.count = 1;
                }
                if param.name.trim().is_empty() {
                    param.name = format!("read_{idx}");
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker is empty".into()));
        }
        if self.mqtt.security_mode == SecurityMode::Tls {
            if self.mqtt.tls.ca_cert.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "mqtt.tls.ca_cert is required when security_mode is tls".into(),
                ));
            }
            let has_cert = !self.mqtt.tls.client_cert.trim().is_empty();
            let has_key = !self.mqtt.tls.client_key.trim().is_empty();
            if has_cert != has_key {
                return Err(ConfigError::Invalid(
                    "mqtt.tls.client_cert and client_key must be set together".into(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for device in &self.io_devices {
            if device.io_device_id.trim().is_empty() {
                return Err(ConfigError::Invalid("io_device_id cannot be empty".into()));
            }
            if device.ip.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device {} has no address",
                    device.io_device_id
                )));
            }
            if !seen.insert(device.io_device_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate io_device_id: {}",
                    device.io_device_id
                )));
            }
        }

        Ok(())
    }
}

/// Decode a configuration document, applying defaults and validation
pub fn decode(raw: &[u8]) -> Result<GatewayConfig, ConfigError> {
    let mut config: GatewayConfig = serde_json::from_slice(raw)?;
    config.normalize();
    config.validate()?;
    Ok(config)
}

pub fn encode(config: &GatewayConfig) -> Result<Vec<u8>, ConfigError> {
    Ok(serde_json::to_vec_pretty(config)?)
}

/// Process-level settings read from the environment
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub config_path: PathBuf,
    pub serial_path: PathBuf,
    pub queue_capacity: usize,
    pub retry_interval: Duration,
    pub io_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            serial_path: PathBuf::from(SERIAL_FILE_PATH),
            queue_capacity: 256,
            retry_interval: Duration::from_secs(5),
            io_timeout: Duration::from_millis(3000),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: std::env::var("FORGEEDGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            serial_path: std::env::var("FORGEEDGE_SERIAL")
                .map(PathBuf::from)
                .unwrap_or(defaults.serial_path),
            queue_capacity: env_or("FORGEEDGE_QUEUE_CAPACITY", defaults.queue_capacity),
            retry_interval: Duration::from_secs(env_or(
                "FORGEEDGE_RETRY_SECS",
                defaults.retry_interval.as_secs(),
            )),
            io_timeout: Duration::from_millis(env_or(
                "FORGEEDGE_READ_TIMEOUT_MS",
                defaults.io_timeout.as_millis() as u64,
            )),
            drain_timeout: Duration::from_secs(env_or(
                "FORGEEDGE_DRAIN_SECS",
                defaults.drain_timeout.as_secs(),
            )),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using default", key, value);
            default
        }),
        Err(_) => default,
    }
}
