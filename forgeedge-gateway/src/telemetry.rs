//! Telemetry records and topic naming
//!
//! Payload layout (one record per device per poll cycle):
//! ```json
//! { "edge_id": "edge-01", "io_device_id": "tank1", "timestamp": 1700000000,
//!   "data": [ { "name": "level", "type": "holding", "value": 25.0 } ] }
//! ```

use serde::Serialize;

use crate::config::{DataMode, ParameterConfig};
use crate::field::{ReadValues, RegisterKind};
use crate::queue::QueueItem;

pub const TOPIC_NAMESPACE: &str = "forgeedge";

/// Inbound configuration updates arrive on this topic
pub const CONTROL_TOPIC: &str = "forgeedge/config";

/// `forgeedge/<gateway id>/<device id>/data`
pub fn telemetry_topic(edge_id: &str, device_id: &str) -> String {
    format!("{}/{}/{}/data", TOPIC_NAMESPACE, edge_id, device_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub edge_id: String,
    pub io_device_id: String,
    pub timestamp: i64,
    pub data: Vec<DataEntry>,
}

/// One parameter inside a record. An entry whose read failed carries
/// neither `value` nor `raw`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Sample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Sample {
    Integer(u16),
    Integers(Vec<u16>),
    Number(f64),
    Numbers(Vec<f64>),
}

impl DataEntry {
    pub fn missing(name: &str, kind: RegisterKind) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.as_str(),
            value: None,
            raw: None,
        }
    }

    /// Shape read values for the payload.
    ///
    /// Bit reads are always published as `raw` 0/1. Register reads are scaled
    /// into `value` in processed mode and left untouched in `raw` mode. A
    /// single-element parameter yields a scalar, anything larger an array.
    pub fn from_values(
        param: &ParameterConfig,
        kind: RegisterKind,
        values: ReadValues,
        mode: DataMode,
    ) -> Self {
        let mut entry = Self::missing(&param.name, kind);
        if values.is_empty() {
            return entry;
        }
        let scalar = param.effective_count(kind) == 1;

        match values {
            ReadValues::Bits(bits) => {
                let ints: Vec<u16> = bits.into_iter().map(u16::from).collect();
                entry.raw = Some(integers(ints, scalar));
            }
            ReadValues::Registers(regs) => match mode {
                DataMode::Raw => entry.raw = Some(integers(regs, scalar)),
                DataMode::Processed => {
                    let scaled: Vec<f64> = regs.iter().map(|r| f64::from(*r) * param.scale).collect();
                    entry.value = Some(if scalar {
                        Sample::Number(scaled[0])
                    } else {
                        Sample::Numbers(scaled)
                    });
                }
            },
        }

        entry
    }
}

fn integers(values: Vec<u16>, scalar: bool) -> Sample {
    if scalar {
        Sample::Integer(values[0])
    } else {
        Sample::Integers(values)
    }
}

impl TelemetryRecord {
    pub fn new(edge_id: &str, io_device_id: &str, timestamp: i64) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            io_device_id: io_device_id.to_string(),
            timestamp,
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: DataEntry) {
        self.data.push(entry);
    }

    pub fn topic(&self) -> String {
        telemetry_topic(&self.edge_id, &self.io_device_id)
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn into_queue_item(self) -> Result<QueueItem, serde_json::Error> {
        let payload = self.to_payload()?;
        Ok(QueueItem::new(self.topic(), payload))
    }
}
